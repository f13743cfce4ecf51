//! Continuation scheduler - drives a compiled script against the flow node
//! graph as a persistent, resumable state machine
//!
//! All graph mutation funnels through `tick`, serialized by a single lock, so
//! every checkpoint is a consistent snapshot of the whole execution. The
//! engine never advances its in-memory state past a point that has not been
//! persisted: a tick stages its changes, saves the checkpoint, and only then
//! dispatches successors; a persistence failure rolls the stage back and
//! aborts the execution as an engine fault.

use crate::core::graph::{BlockKind, FlowGraph, NodeId, NodeKind};
use crate::core::script::{ParallelBranch, Script, Statement, StepCall};
use crate::core::state::{ExecutionStatus, FlowOutcome, StepFailure, StepOutcome};
use crate::execution::branch::{
    Binding, BlockResult, Branch, BranchId, BranchResult, CurrentWork, DeferredTick, Frame,
    FrameKind, JoinId, ParallelJoin,
};
use crate::execution::gate::GateController;
use crate::execution::resource::{
    LeasePickleFactory, LocalResourceProvider, ResourceProvider, LOCAL_LEASE_TAG,
};
use crate::execution::runner::{BuiltinRunner, CancelSignal, StepContext, StepRunner};
use crate::persistence::{BranchSnapshot, ExecutionOwner, ExecutionSnapshot, PersistError};
use crate::pickle::{LiveObject, PickleDescriptor, PickleRegistry};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine errors surfaced to callers of the entry points
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("execution already started")]
    AlreadyStarted,

    #[error("execution `{0}` is already loaded")]
    AlreadyLoaded(Uuid),

    #[error("no checkpoint found for execution `{0}`")]
    MissingCheckpoint(Uuid),

    #[error(transparent)]
    Fault(#[from] EngineFault),
}

/// Graph or checkpoint corruption, persistence I/O failure; always fatal
#[derive(Debug, thiserror::Error)]
pub enum EngineFault {
    #[error("checkpoint persistence failed: {0}")]
    Checkpoint(#[from] PersistError),

    #[error("corrupt execution state: {0}")]
    Corrupt(String),
}

/// Events delivered to registered handlers during execution
#[derive(Debug, Clone)]
pub enum FlowEvent {
    ExecutionStarted {
        execution_id: Uuid,
        script: String,
    },
    StepStarted {
        node: NodeId,
        step: String,
        branch: String,
    },
    StepCompleted {
        node: NodeId,
        step: String,
        branch: String,
        success: bool,
    },
    RetryScheduled {
        node: NodeId,
        branch: String,
        attempts_left: u32,
    },
    BranchStarted {
        node: NodeId,
        branch: String,
    },
    ResourceAcquired {
        node: NodeId,
        resource: String,
        branch: String,
    },
    ResourceReleased {
        resource: String,
        branch: String,
    },
    PauseChanged {
        paused: bool,
    },
    RehydrationWaiting {
        branch: String,
        message: String,
    },
    ExecutionFinished {
        execution_id: Uuid,
        outcome: FlowOutcome,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(FlowEvent) + Send + Sync>;

/// One currently-active step or block, as reported by `current_executions`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepHandle {
    pub node: NodeId,
    /// Step function name, or the block label ("retry", "parallel", "resource")
    pub name: String,
    pub block: bool,
}

impl StepHandle {
    /// Display label; blocks get trailing braces
    pub fn label(&self) -> String {
        if self.block {
            format!("{} {{}}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Collaborators the engine is constructed with
#[derive(Clone)]
pub struct FlowConfig {
    pub runner: Arc<dyn StepRunner>,
    pub resources: Arc<dyn ResourceProvider>,
    pub pickles: Arc<PickleRegistry>,
    /// Delay between rehydration attempts for unrecovered pickles
    pub rehydration_interval: Duration,
}

impl FlowConfig {
    /// Built-in runner and local resources, with the lease pickle factory
    /// registered. Returns the gate controller driving `gate` steps.
    pub fn standard() -> (Self, GateController) {
        let gates = GateController::new();
        let provider = Arc::new(LocalResourceProvider::new());
        let mut pickles = PickleRegistry::new();
        pickles.register(
            LOCAL_LEASE_TAG,
            Arc::new(LeasePickleFactory::new(Arc::clone(&provider))),
        );
        let config = Self {
            runner: Arc::new(BuiltinRunner::new(gates.clone())),
            resources: provider,
            pickles: Arc::new(pickles),
            rehydration_interval: Duration::from_secs(5),
        };
        (config, gates)
    }
}

/// A dispatched step or acquisition currently running on a worker task
struct InFlight {
    branch: BranchId,
    cancel: watch::Sender<bool>,
}

/// Mutable engine state, serialized under one lock
struct State {
    status: ExecutionStatus,
    graph: FlowGraph,
    /// Live branches; each carries one active head
    branches: BTreeMap<BranchId, Branch>,
    /// Branches waiting for their parallel block to join, keyed by join
    parked: BTreeMap<JoinId, Branch>,
    joins: BTreeMap<JoinId, ParallelJoin>,
    next_branch: BranchId,
    next_join: JoinId,
    paused: bool,
    deferred: VecDeque<DeferredTick>,
    in_flight: HashMap<NodeId, InFlight>,
    outcome: Option<FlowOutcome>,
}

impl State {
    fn fresh() -> Self {
        Self {
            status: ExecutionStatus::New,
            graph: FlowGraph::new(),
            branches: BTreeMap::new(),
            parked: BTreeMap::new(),
            joins: BTreeMap::new(),
            next_branch: 0,
            next_join: 0,
            paused: false,
            deferred: VecDeque::new(),
            in_flight: HashMap::new(),
            outcome: None,
        }
    }

    fn branch_id_at(&self, head: NodeId) -> Option<BranchId> {
        self.branches
            .values()
            .find(|b| b.head == head)
            .map(|b| b.id)
    }

    fn has_deferred_for(&self, node: NodeId) -> bool {
        self.deferred.iter().any(|d| match d {
            DeferredTick::Step { node: n, .. } | DeferredTick::AcquireFailed { node: n, .. } => {
                *n == node
            }
            DeferredTick::Advance { .. } => false,
        })
    }

    fn any_rehydrating(&self) -> bool {
        self.branches
            .values()
            .chain(self.parked.values())
            .any(|b| b.rehydrating)
    }
}

/// Copy of the checkpoint-relevant state, taken before a mutation so a failed
/// save can be rolled back
struct Staged {
    status: ExecutionStatus,
    graph_len: usize,
    branches: BTreeMap<BranchId, Branch>,
    parked: BTreeMap<JoinId, Branch>,
    joins: BTreeMap<JoinId, ParallelJoin>,
    next_branch: BranchId,
    next_join: JoinId,
    paused: bool,
    deferred: VecDeque<DeferredTick>,
    outcome: Option<FlowOutcome>,
}

impl Staged {
    fn capture(state: &State) -> Self {
        Self {
            status: state.status,
            graph_len: state.graph.len(),
            branches: state.branches.clone(),
            parked: state.parked.clone(),
            joins: state.joins.clone(),
            next_branch: state.next_branch,
            next_join: state.next_join,
            paused: state.paused,
            deferred: state.deferred.clone(),
            outcome: state.outcome.clone(),
        }
    }

    fn rollback(self, state: &mut State) {
        state.status = self.status;
        state.graph.truncate(self.graph_len);
        state.branches = self.branches;
        state.parked = self.parked;
        state.joins = self.joins;
        state.next_branch = self.next_branch;
        state.next_join = self.next_join;
        state.paused = self.paused;
        state.deferred = self.deferred;
        state.outcome = self.outcome;
    }
}

/// Side effects produced by a staged mutation, executed only after the
/// checkpoint has been persisted
enum DispatchAction {
    RunStep {
        node: NodeId,
        branch: BranchId,
        branch_name: String,
        call: StepCall,
        bindings: BTreeMap<String, serde_json::Value>,
    },
    Acquire {
        node: NodeId,
        branch: BranchId,
        resource: String,
    },
    Release {
        handle: Arc<dyn LiveObject>,
    },
    Rehydrate {
        branch: BranchId,
        branch_name: String,
        pickled: Vec<(String, PickleDescriptor)>,
    },
}

/// How a staged mutation wants to be persisted
#[derive(Clone, Copy, PartialEq)]
enum StagedOutcome {
    /// No checkpoint needed; side effects still run
    Skip,
    /// Persist before committing; failure rolls back and faults the execution
    Persist,
    /// Persist, but commit even if the save fails (abort paths)
    BestEffort,
}

/// A step or acquisition completion entering the scheduler
enum Completion {
    Step(StepOutcome),
    Acquired(Arc<dyn LiveObject>),
    AcquireFailed(StepFailure),
    AcquireInterrupted,
}

/// One running pipeline execution
pub struct FlowExecution {
    /// Self-handle for the worker tasks the engine spawns
    me: Weak<FlowExecution>,
    id: Uuid,
    script: Script,
    owner: Arc<dyn ExecutionOwner>,
    runner: Arc<dyn StepRunner>,
    resources: Arc<dyn ResourceProvider>,
    pickles: Arc<PickleRegistry>,
    rehydration_interval: Duration,
    state: Mutex<State>,
    handlers: std::sync::Mutex<Vec<EventHandler>>,
    /// Version bumped whenever rehydration or lifecycle state changes
    ready: watch::Sender<u64>,
    /// Execution-wide abort signal; rehydration loops watch it
    abort: watch::Sender<bool>,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl FlowExecution {
    /// Create a fresh, unstarted execution
    pub fn new(script: Script, owner: Arc<dyn ExecutionOwner>, config: FlowConfig) -> Arc<Self> {
        let id = owner.execution_id();
        let (abort, _) = watch::channel(false);
        let (ready, _) = watch::channel(0);
        let (status_tx, _) = watch::channel(ExecutionStatus::New);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            script,
            owner,
            runner: config.runner,
            resources: config.resources,
            pickles: config.pickles,
            rehydration_interval: config.rehydration_interval,
            state: Mutex::new(State::fresh()),
            handlers: std::sync::Mutex::new(Vec::new()),
            ready,
            abort,
            status_tx,
        })
    }

    /// Owned handle to this engine for spawned tasks
    fn strong(&self) -> Arc<Self> {
        self.me.upgrade().expect("engine still referenced")
    }

    /// Rebuild an execution from its owner's checkpoint
    ///
    /// The result is inert until [`FlowExecution::resume`] is called.
    pub async fn load(
        owner: Arc<dyn ExecutionOwner>,
        config: FlowConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let snapshot = owner
            .load_checkpoint()
            .await
            .map_err(EngineFault::Checkpoint)?
            .ok_or_else(|| EngineError::MissingCheckpoint(owner.execution_id()))?;
        Ok(Self::restore(snapshot, owner, config))
    }

    fn restore(
        snapshot: ExecutionSnapshot,
        owner: Arc<dyn ExecutionOwner>,
        config: FlowConfig,
    ) -> Arc<Self> {
        let mut state = State::fresh();
        state.status = snapshot.status;
        state.paused = snapshot.paused;
        state.outcome = snapshot.outcome.clone();
        state.graph = FlowGraph::from_nodes(snapshot.nodes);
        state.next_branch = snapshot.next_branch;
        state.next_join = snapshot.next_join;
        state.deferred = snapshot.deferred.into();
        for branch in snapshot.branches {
            let branch = branch.restore();
            state.branches.insert(branch.id, branch);
        }
        for (join, branch) in snapshot.parked {
            state.parked.insert(join, branch.restore());
        }
        for join in snapshot.joins {
            state.joins.insert(join.id, join);
        }

        let (abort, _) = watch::channel(false);
        let (ready, _) = watch::channel(0);
        let (status_tx, _) = watch::channel(snapshot.status);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: snapshot.execution_id,
            script: snapshot.script,
            owner,
            runner: config.runner,
            resources: config.resources,
            pickles: config.pickles,
            rehydration_interval: config.rehydration_interval,
            state: Mutex::new(state),
            handlers: std::sync::Mutex::new(Vec::new()),
            ready,
            abort,
            status_tx,
        })
    }

    pub fn execution_id(&self) -> Uuid {
        self.id
    }

    /// Whether the compiled script runs under restricted execution mode
    pub fn is_sandboxed(&self) -> bool {
        self.script.sandbox
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.state.lock().await.status
    }

    pub async fn outcome(&self) -> Option<FlowOutcome> {
        self.state.lock().await.outcome.clone()
    }

    /// The active head set: one node per live branch
    pub async fn heads(&self) -> Vec<NodeId> {
        let state = self.state.lock().await;
        state.branches.values().map(|b| b.head).collect()
    }

    /// Observe lifecycle transitions without polling
    pub fn status_watch(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    /// Wait until the execution reaches a terminal state; returns the outcome
    pub async fn wait_terminal(&self) -> Option<FlowOutcome> {
        let mut rx = self.status_watch();
        loop {
            if self.status().await.is_terminal() {
                return self.outcome().await;
            }
            if rx.changed().await.is_err() {
                return self.outcome().await;
            }
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(FlowEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().expect("handler lock poisoned");
        handlers.push(Arc::new(handler));
    }

    fn notify_ready(&self) {
        self.ready.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn emit(&self, events: Vec<FlowEvent>) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers.lock().expect("handler lock poisoned").clone();
        for event in events {
            for handler in &handlers {
                handler(event.clone());
            }
        }
    }

    /// Start the execution: `New → Running`, dispatch the first step(s)
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        if guard.status != ExecutionStatus::New {
            return Err(EngineError::AlreadyStarted);
        }
        info!(execution = %self.id, script = %self.script.name, "starting execution");
        let events = self
            .staged(&mut guard, |engine, state, actions, events| {
                state.status = ExecutionStatus::Running;
                let root = state.graph.append(vec![], NodeKind::FlowStart);
                let id = state.next_branch;
                state.next_branch += 1;
                let branch = Branch::new(
                    id,
                    "main",
                    root,
                    vec![Frame::new(
                        FrameKind::Root,
                        root,
                        engine.script.statements.clone(),
                    )],
                );
                state.branches.insert(id, branch);
                events.push(FlowEvent::ExecutionStarted {
                    execution_id: engine.id,
                    script: engine.script.name.clone(),
                });
                if state.paused {
                    state.status = ExecutionStatus::Paused;
                } else {
                    engine.advance_branch(state, id, actions, events);
                }
                StagedOutcome::Persist
            })
            .await?;
        drop(guard);
        self.emit(events);
        Ok(())
    }

    /// Resume a loaded execution: spawn rehydration for blocked branches and
    /// re-dispatch the restored heads
    pub async fn resume(&self) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        if guard.status.is_terminal() || guard.status == ExecutionStatus::New {
            return Ok(());
        }
        info!(execution = %self.id, "resuming from checkpoint");
        let events = self
            .staged(&mut guard, |engine, state, actions, events| {
                // Rehydration first: blocked branches stay undispatched
                let rehydrating: Vec<_> = state
                    .branches
                    .values()
                    .chain(state.parked.values())
                    .filter(|b| b.rehydrating)
                    .map(|b| (b.id, b.name.clone(), b.pickled_bindings()))
                    .collect();
                for (branch, branch_name, pickled) in rehydrating {
                    actions.push(DispatchAction::Rehydrate {
                        branch,
                        branch_name,
                        pickled,
                    });
                }
                if !state.paused {
                    engine.redispatch_idle(state, actions, events);
                    return StagedOutcome::Skip;
                }
                // A pause that was still draining when the checkpoint was
                // taken has nothing left in flight now
                if state.status == ExecutionStatus::Running {
                    state.status = ExecutionStatus::Paused;
                    return StagedOutcome::Persist;
                }
                StagedOutcome::Skip
            })
            .await?;
        drop(guard);
        self.emit(events);
        Ok(())
    }

    /// Suspend or resume dispatch of new steps; idempotent in both directions
    pub async fn pause(&self, enable: bool) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        if guard.status.is_terminal() || guard.paused == enable {
            return Ok(());
        }
        info!(execution = %self.id, enable, "pause toggled");
        let events = self
            .staged(&mut guard, |engine, state, actions, events| {
                state.paused = enable;
                events.push(FlowEvent::PauseChanged { paused: enable });
                if enable {
                    if state.status == ExecutionStatus::Running && state.in_flight.is_empty() {
                        state.status = ExecutionStatus::Paused;
                    }
                } else {
                    if state.status == ExecutionStatus::Paused {
                        state.status = ExecutionStatus::Running;
                    }
                    // Replay completions queued while paused, then wake any
                    // branch left without a worker
                    while let Some(deferred) = state.deferred.pop_front() {
                        match deferred {
                            DeferredTick::Step { node, outcome } => {
                                engine.apply_completion(
                                    state,
                                    node,
                                    Completion::Step(outcome),
                                    actions,
                                    events,
                                );
                            }
                            DeferredTick::AcquireFailed { node, failure } => {
                                engine.apply_completion(
                                    state,
                                    node,
                                    Completion::AcquireFailed(failure),
                                    actions,
                                    events,
                                );
                            }
                            DeferredTick::Advance { branch } => {
                                if state.branches.contains_key(&branch) {
                                    engine.advance_branch(state, branch, actions, events);
                                }
                            }
                        }
                    }
                    engine.redispatch_idle(state, actions, events);
                }
                StagedOutcome::Persist
            })
            .await?;
        drop(guard);
        self.notify_ready();
        self.emit(events);
        Ok(())
    }

    /// External cancellation: abort every live branch, best effort
    pub async fn interrupt(&self, reason: &str) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        if guard.status.is_terminal() {
            return Ok(());
        }
        warn!(execution = %self.id, reason, "interrupting execution");
        let reason = reason.to_string();
        let events = self
            .staged(&mut guard, move |engine, state, actions, events| {
                let heads: Vec<NodeId> = state.branches.values().map(|b| b.head).collect();
                if !heads.is_empty() {
                    state.graph.append(heads, NodeKind::FlowEnd);
                }
                // Scoped-acquisition contract: live handles are released even
                // on abort
                for branch in state.branches.values().chain(state.parked.values()) {
                    for binding in branch.bindings.values() {
                        if let Binding::Live(handle) = binding {
                            actions.push(DispatchAction::Release {
                                handle: Arc::clone(handle),
                            });
                        }
                    }
                }
                for in_flight in state.in_flight.values() {
                    let _ = in_flight.cancel.send(true);
                }
                state.in_flight.clear();
                state.branches.clear();
                state.parked.clear();
                state.joins.clear();
                state.deferred.clear();
                state.status = ExecutionStatus::Aborted;
                state.outcome = Some(FlowOutcome::Aborted {
                    reason: reason.clone(),
                });
                events.push(FlowEvent::ExecutionFinished {
                    execution_id: engine.id,
                    outcome: FlowOutcome::Aborted { reason },
                });
                StagedOutcome::BestEffort
            })
            .await?;
        drop(guard);
        let _ = self.abort.send(true);
        self.notify_ready();
        self.emit(events);
        Ok(())
    }

    /// Advance the graph after a leaf step completes
    ///
    /// The single serialization point for graph mutation; invoked by the
    /// worker task that ran the step.
    pub async fn tick(
        &self,
        node: NodeId,
        outcome: StepOutcome,
    ) -> Result<(), EngineError> {
        self.tick_inner(node, Completion::Step(outcome)).await
    }

    async fn tick_acquired(
        &self,
        node: NodeId,
        result: Result<Arc<dyn LiveObject>, StepFailure>,
        interrupted: bool,
    ) -> Result<(), EngineError> {
        let completion = match (result, interrupted) {
            (Ok(handle), false) => Completion::Acquired(handle),
            (Ok(handle), true) => {
                // Acquisition raced the cancellation; give the handle back
                let resources = Arc::clone(&self.resources);
                tokio::spawn(async move {
                    resources.release(handle).await;
                });
                Completion::AcquireInterrupted
            }
            (Err(failure), false) => Completion::AcquireFailed(failure),
            (Err(_), true) => Completion::AcquireInterrupted,
        };
        self.tick_inner(node, completion).await
    }

    async fn tick_inner(
        &self,
        node: NodeId,
        completion: Completion,
    ) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        if guard.status.is_terminal() {
            // Abort already recorded; late results are discarded
            debug!(%node, "discarding completion after terminal state");
            return Ok(());
        }
        if guard.in_flight.remove(&node).is_none() {
            debug!(%node, "discarding completion for unknown dispatch");
            return Ok(());
        }
        let events = self
            .staged(&mut guard, move |engine, state, actions, events| {
                if state.paused {
                    engine.defer_completion(state, node, completion);
                    if state.status == ExecutionStatus::Running && state.in_flight.is_empty() {
                        state.status = ExecutionStatus::Paused;
                    }
                } else {
                    engine.apply_completion(state, node, completion, actions, events);
                }
                StagedOutcome::Persist
            })
            .await?;
        drop(guard);
        self.notify_ready();
        self.emit(events);
        Ok(())
    }

    /// For every active branch, the innermost leaf step - or the whole chain
    /// of enclosing blocks, outer to inner, followed by the leaves
    ///
    /// Asynchronous because entries may have to wait for rehydration to
    /// materialize.
    pub async fn current_executions(&self, innermost_only: bool) -> Vec<StepHandle> {
        let mut rx = self.ready.subscribe();
        loop {
            {
                let state = self.state.lock().await;
                if state.status.is_terminal() || !state.any_rehydrating() {
                    return Self::collect_handles(&state, innermost_only);
                }
            }
            if rx.changed().await.is_err() {
                let state = self.state.lock().await;
                return Self::collect_handles(&state, innermost_only);
            }
        }
    }

    fn collect_handles(state: &State, innermost_only: bool) -> Vec<StepHandle> {
        let mut blocks: Vec<StepHandle> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut leaves: Vec<StepHandle> = Vec::new();

        for branch in state.branches.values() {
            let mut chain = Self::chain_blocks(state, branch);
            let leaf = match &branch.current {
                Some(CurrentWork::Step { call }) => Some(StepHandle {
                    node: branch.head,
                    name: call.name.clone(),
                    block: false,
                }),
                // Mid-acquisition the resource block itself is the innermost
                // entry
                Some(CurrentWork::Acquire { .. }) => chain.pop(),
                None => None,
            };
            let Some(leaf) = leaf else { continue };
            for block in chain {
                if seen.insert(block.node) {
                    blocks.push(block);
                }
            }
            leaves.push(leaf);
        }

        if innermost_only {
            leaves
        } else {
            blocks.extend(leaves);
            blocks
        }
    }

    /// Enclosing block chain for a branch, outermost first, crossing parked
    /// parallel owners
    fn chain_blocks(state: &State, branch: &Branch) -> Vec<StepHandle> {
        let mut chain = Vec::new();
        if let Some(Frame {
            kind: FrameKind::Branch { join, .. },
            ..
        }) = branch.frames.first()
        {
            if let Some(owner) = state.parked.get(join) {
                chain = Self::chain_blocks(state, owner);
            }
            if let Some(join) = state.joins.get(join) {
                chain.push(StepHandle {
                    node: join.enter,
                    name: BlockKind::Parallel.label().to_string(),
                    block: true,
                });
            }
        }
        for frame in &branch.frames {
            let name = match &frame.kind {
                FrameKind::Retry { .. } => BlockKind::Retry.label(),
                FrameKind::Resource { .. } => BlockKind::Resource.label(),
                FrameKind::Root | FrameKind::Branch { .. } => continue,
            };
            chain.push(StepHandle {
                node: frame.enter,
                name: name.to_string(),
                block: true,
            });
        }
        chain
    }

    // ------------------------------------------------------------------
    // Staged mutation protocol
    // ------------------------------------------------------------------

    /// Run a mutation against the locked state, persist the checkpoint, and
    /// only then execute its side effects. On a failed save the mutation is
    /// rolled back and the execution aborts with an engine fault.
    async fn staged<F>(
        &self,
        state: &mut State,
        mutate: F,
    ) -> Result<Vec<FlowEvent>, EngineError>
    where
        F: FnOnce(
            &Self,
            &mut State,
            &mut Vec<DispatchAction>,
            &mut Vec<FlowEvent>,
        ) -> StagedOutcome,
    {
        let staged = Staged::capture(state);
        let mut actions = Vec::new();
        let mut events = Vec::new();
        let outcome = mutate(self, state, &mut actions, &mut events);

        if outcome == StagedOutcome::Skip {
            self.commit(state, actions);
            self.status_tx.send_replace(state.status);
            return Ok(events);
        }

        let result = match self.build_snapshot(state) {
            Ok(snapshot) => self.owner.save_checkpoint(&snapshot).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.commit(state, actions);
                self.status_tx.send_replace(state.status);
                Ok(events)
            }
            Err(err) if outcome == StagedOutcome::BestEffort => {
                error!(execution = %self.id, %err, "checkpoint failed during abort");
                self.commit(state, actions);
                self.status_tx.send_replace(state.status);
                Ok(events)
            }
            Err(err) => {
                error!(execution = %self.id, %err, "checkpoint failed; aborting execution");
                staged.rollback(state);
                for in_flight in state.in_flight.values() {
                    let _ = in_flight.cancel.send(true);
                }
                state.in_flight.clear();
                state.branches.clear();
                state.parked.clear();
                state.joins.clear();
                state.status = ExecutionStatus::Aborted;
                let reason = format!("checkpoint persistence failed: {}", err);
                state.outcome = Some(FlowOutcome::Aborted {
                    reason: reason.clone(),
                });
                let _ = self.abort.send(true);
                self.status_tx.send_replace(ExecutionStatus::Aborted);
                self.notify_ready();
                self.emit(vec![FlowEvent::ExecutionFinished {
                    execution_id: self.id,
                    outcome: FlowOutcome::Aborted { reason },
                }]);
                Err(EngineError::Fault(EngineFault::Checkpoint(err)))
            }
        }
    }

    fn build_snapshot(&self, state: &State) -> Result<ExecutionSnapshot, PersistError> {
        let mut branches = Vec::new();
        for branch in state.branches.values() {
            branches.push(BranchSnapshot::capture(branch, &self.pickles)?);
        }
        let mut parked = Vec::new();
        for (join, branch) in &state.parked {
            parked.push((*join, BranchSnapshot::capture(branch, &self.pickles)?));
        }
        Ok(ExecutionSnapshot {
            execution_id: self.id,
            script: self.script.clone(),
            status: state.status,
            paused: state.paused,
            outcome: state.outcome.clone(),
            nodes: state.graph.clone().into_nodes(),
            branches,
            parked,
            joins: state.joins.values().cloned().collect(),
            next_branch: state.next_branch,
            next_join: state.next_join,
            deferred: state.deferred.iter().cloned().collect(),
            saved_at: Utc::now(),
        })
    }

    /// Execute the side effects of a committed mutation
    fn commit(&self, state: &mut State, actions: Vec<DispatchAction>) {
        for action in actions {
            match action {
                DispatchAction::RunStep {
                    node,
                    branch,
                    branch_name,
                    call,
                    bindings,
                } => {
                    let (tx, rx) = watch::channel(false);
                    state.in_flight.insert(node, InFlight { branch, cancel: tx });
                    let engine = self.strong();
                    let runner = Arc::clone(&self.runner);
                    let ctx = StepContext {
                        execution_id: self.id,
                        node,
                        branch: branch_name,
                        bindings,
                        cancel: CancelSignal::new(rx),
                    };
                    tokio::spawn(async move {
                        let outcome = runner.run(&call, ctx).await;
                        if let Err(err) = engine.tick(node, outcome).await {
                            error!(%node, %err, "tick failed");
                        }
                    });
                }
                DispatchAction::Acquire {
                    node,
                    branch,
                    resource,
                } => {
                    let (tx, rx) = watch::channel(false);
                    state.in_flight.insert(node, InFlight { branch, cancel: tx });
                    let engine = self.strong();
                    let resources = Arc::clone(&self.resources);
                    tokio::spawn(async move {
                        let cancel = CancelSignal::new(rx);
                        let result = resources.acquire(&resource, cancel.clone()).await;
                        let interrupted = cancel.is_cancelled();
                        if let Err(err) = engine.tick_acquired(node, result, interrupted).await {
                            error!(%node, %err, "acquisition tick failed");
                        }
                    });
                }
                DispatchAction::Release { handle } => {
                    let resources = Arc::clone(&self.resources);
                    tokio::spawn(async move {
                        resources.release(handle).await;
                    });
                }
                DispatchAction::Rehydrate {
                    branch,
                    branch_name,
                    pickled,
                } => {
                    self.spawn_rehydration(branch, branch_name, pickled);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Interpreter
    // ------------------------------------------------------------------

    /// Drive a branch forward until it suspends (step dispatch, resource
    /// acquisition, parallel fan-out) or terminates
    fn advance_branch(
        &self,
        state: &mut State,
        id: BranchId,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        loop {
            let Some(branch) = state.branches.get_mut(&id) else {
                return;
            };
            if branch.cancelled {
                self.unwind_cancelled(state, id, actions, events);
                return;
            }
            let next = branch
                .frames
                .last_mut()
                .and_then(|frame| frame.remaining.pop_front());

            match next {
                Some(Statement::Step(call)) => {
                    let head = state.branches[&id].head;
                    let node = state.graph.append(
                        vec![head],
                        NodeKind::StepStart {
                            step: call.name.clone(),
                        },
                    );
                    let branch = state.branches.get_mut(&id).expect("branch exists");
                    branch.head = node;
                    branch.current = Some(CurrentWork::Step { call: call.clone() });
                    events.push(FlowEvent::StepStarted {
                        node,
                        step: call.name.clone(),
                        branch: branch.name.clone(),
                    });
                    actions.push(DispatchAction::RunStep {
                        node,
                        branch: id,
                        branch_name: branch.name.clone(),
                        call,
                        bindings: branch.value_bindings(),
                    });
                    return;
                }
                Some(Statement::Retry { attempts, body }) => {
                    let head = state.branches[&id].head;
                    let node = state.graph.append(
                        vec![head],
                        NodeKind::BlockStart {
                            block: BlockKind::Retry,
                        },
                    );
                    let branch = state.branches.get_mut(&id).expect("branch exists");
                    branch.head = node;
                    branch.frames.push(Frame::new(
                        FrameKind::Retry {
                            attempts_left: attempts,
                            body: body.clone(),
                        },
                        node,
                        body,
                    ));
                }
                Some(Statement::Resource { resource, body }) => {
                    let head = state.branches[&id].head;
                    let node = state.graph.append(
                        vec![head],
                        NodeKind::BlockStart {
                            block: BlockKind::Resource,
                        },
                    );
                    let key = format!("res:{}", node);
                    let branch = state.branches.get_mut(&id).expect("branch exists");
                    branch.head = node;
                    branch.frames.push(Frame::new(
                        FrameKind::Resource {
                            resource: resource.clone(),
                            key: key.clone(),
                        },
                        node,
                        body,
                    ));
                    branch.current = Some(CurrentWork::Acquire {
                        resource: resource.clone(),
                        key,
                    });
                    actions.push(DispatchAction::Acquire {
                        node,
                        branch: id,
                        resource,
                    });
                    return;
                }
                Some(Statement::Parallel {
                    branches,
                    fail_fast,
                }) => {
                    if branches.is_empty() {
                        // Degenerate block: enter and exit in place
                        let head = state.branches[&id].head;
                        let enter = state.graph.append(
                            vec![head],
                            NodeKind::BlockStart {
                                block: BlockKind::Parallel,
                            },
                        );
                        let exit = state
                            .graph
                            .append(vec![enter], NodeKind::BlockEnd { start: enter });
                        state.branches.get_mut(&id).expect("branch exists").head = exit;
                        continue;
                    }
                    self.enter_parallel(state, id, branches, fail_fast, actions, events);
                    return;
                }
                None => {
                    if self.exit_block(state, id, actions, events) {
                        return;
                    }
                }
            }
        }
    }

    /// Fan out: one independent head per branch, the owner parked until the
    /// join
    fn enter_parallel(
        &self,
        state: &mut State,
        id: BranchId,
        branches: Vec<ParallelBranch>,
        fail_fast: bool,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        let head = state.branches[&id].head;
        let enter = state.graph.append(
            vec![head],
            NodeKind::BlockStart {
                block: BlockKind::Parallel,
            },
        );
        let join_id = state.next_join;
        state.next_join += 1;
        state.joins.insert(
            join_id,
            ParallelJoin {
                id: join_id,
                enter,
                fail_fast,
                pending: branches.len() as u32,
                results: Vec::new(),
                first_failure: None,
                aborting: false,
            },
        );

        let owner_name = state.branches[&id].name.clone();
        let bindings = state.branches[&id].bindings.clone();
        let mut child_ids = Vec::new();
        for parallel_branch in branches {
            let child_id = state.next_branch;
            state.next_branch += 1;
            let child_name = if owner_name == "main" {
                parallel_branch.name.clone()
            } else {
                format!("{}/{}", owner_name, parallel_branch.name)
            };
            let node = state.graph.append(
                vec![enter],
                NodeKind::BranchStart {
                    branch: parallel_branch.name.clone(),
                    parallel: enter,
                },
            );
            let mut child = Branch::new(
                child_id,
                child_name.clone(),
                node,
                vec![Frame::new(
                    FrameKind::Branch {
                        join: join_id,
                        name: parallel_branch.name,
                    },
                    node,
                    parallel_branch.body,
                )],
            );
            child.bindings = bindings.clone();
            state.branches.insert(child_id, child);
            events.push(FlowEvent::BranchStarted {
                node,
                branch: child_name,
            });
            child_ids.push(child_id);
        }

        let mut owner = state.branches.remove(&id).expect("owner exists");
        owner.head = enter;
        owner.current = None;
        state.parked.insert(join_id, owner);

        for child_id in child_ids {
            self.advance_branch(state, child_id, actions, events);
        }
    }

    /// Pop the branch's top frame; returns true when the branch suspended or
    /// terminated and the advance loop must stop
    fn exit_block(
        &self,
        state: &mut State,
        id: BranchId,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) -> bool {
        let frame = state
            .branches
            .get_mut(&id)
            .expect("branch exists")
            .frames
            .pop()
            .expect("frame stack never empty while advancing");
        match frame.kind {
            FrameKind::Root => {
                let head = state.branches[&id].head;
                state.graph.append(vec![head], NodeKind::FlowEnd);
                state.branches.remove(&id);
                state.status = ExecutionStatus::Complete;
                state.outcome = Some(FlowOutcome::Success);
                events.push(FlowEvent::ExecutionFinished {
                    execution_id: self.id,
                    outcome: FlowOutcome::Success,
                });
                info!(execution = %self.id, "execution complete");
                true
            }
            FrameKind::Retry { .. } => {
                // Success short-circuits regardless of attempts left
                self.close_block(state, id, frame.enter);
                false
            }
            FrameKind::Resource { resource, key } => {
                self.release_binding(state, id, &resource, &key, actions, events);
                self.close_block(state, id, frame.enter);
                false
            }
            FrameKind::Branch { join, .. } => {
                self.finish_branch_into_join(state, id, join, None, false, actions, events);
                true
            }
        }
    }

    /// Append the block-exit node and advance the branch head onto it
    fn close_block(&self, state: &mut State, id: BranchId, enter: NodeId) {
        let head = state.branches[&id].head;
        let node = state
            .graph
            .append(vec![head], NodeKind::BlockEnd { start: enter });
        state.branches.get_mut(&id).expect("branch exists").head = node;
    }

    /// Release a resource binding and record the event
    fn release_binding(
        &self,
        state: &mut State,
        id: BranchId,
        resource: &str,
        key: &str,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        let branch = state.branches.get_mut(&id).expect("branch exists");
        if let Some(Binding::Live(handle)) = branch.bindings.remove(key) {
            actions.push(DispatchAction::Release { handle });
        }
        events.push(FlowEvent::ResourceReleased {
            resource: resource.to_string(),
            branch: branch.name.clone(),
        });
    }

    /// Interpret a step failure through the enclosing blocks, innermost
    /// first; `origin` names the branch the failure started on
    fn fail_branch(
        &self,
        state: &mut State,
        id: BranchId,
        failure: StepFailure,
        origin: String,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        enum Unwind {
            Reenter { enter: NodeId, attempts_left: u32 },
            PopRetry { enter: NodeId },
            PopResource { enter: NodeId, resource: String, key: String },
            Join { join: JoinId },
            FailExecution,
        }

        loop {
            let decision = {
                let Some(branch) = state.branches.get_mut(&id) else {
                    return;
                };
                let Some(frame) = branch.frames.last_mut() else {
                    error!(execution = %self.id, branch = id, "failure escaped the frame stack");
                    return;
                };
                match &mut frame.kind {
                    FrameKind::Retry {
                        attempts_left,
                        body,
                    } => {
                        *attempts_left = attempts_left.saturating_sub(1);
                        if *attempts_left > 0 {
                            // Fresh attempt: re-enter the body as a new
                            // sub-graph region
                            frame.remaining = body.clone().into();
                            Unwind::Reenter {
                                enter: frame.enter,
                                attempts_left: *attempts_left,
                            }
                        } else {
                            Unwind::PopRetry { enter: frame.enter }
                        }
                    }
                    FrameKind::Resource { resource, key } => Unwind::PopResource {
                        enter: frame.enter,
                        resource: resource.clone(),
                        key: key.clone(),
                    },
                    FrameKind::Branch { join, .. } => Unwind::Join { join: *join },
                    FrameKind::Root => Unwind::FailExecution,
                }
            };

            match decision {
                Unwind::Reenter {
                    enter,
                    attempts_left,
                } => {
                    let name = state.branches[&id].name.clone();
                    events.push(FlowEvent::RetryScheduled {
                        node: enter,
                        branch: name,
                        attempts_left,
                    });
                    self.advance_branch(state, id, actions, events);
                    return;
                }
                Unwind::PopRetry { enter } => {
                    // Exhausted: the final attempt's failure propagates
                    // verbatim
                    state
                        .branches
                        .get_mut(&id)
                        .expect("branch exists")
                        .frames
                        .pop();
                    self.close_block(state, id, enter);
                }
                Unwind::PopResource {
                    enter,
                    resource,
                    key,
                } => {
                    state
                        .branches
                        .get_mut(&id)
                        .expect("branch exists")
                        .frames
                        .pop();
                    self.release_binding(state, id, &resource, &key, actions, events);
                    self.close_block(state, id, enter);
                }
                Unwind::Join { join } => {
                    self.finish_branch_into_join(
                        state,
                        id,
                        join,
                        Some(failure),
                        false,
                        actions,
                        events,
                    );
                    return;
                }
                Unwind::FailExecution => {
                    // Uncaught: the whole execution fails with this outcome
                    let head = state.branches[&id].head;
                    state.graph.append(vec![head], NodeKind::FlowEnd);
                    state.branches.remove(&id);
                    state.status = ExecutionStatus::Complete;
                    let outcome = FlowOutcome::Failed {
                        failure,
                        branch: origin,
                    };
                    state.outcome = Some(outcome.clone());
                    events.push(FlowEvent::ExecutionFinished {
                        execution_id: self.id,
                        outcome,
                    });
                    return;
                }
            }
        }
    }

    /// Unwind a cancelled branch: release resources, close its blocks, and
    /// record it at the join as interrupted
    fn unwind_cancelled(
        &self,
        state: &mut State,
        id: BranchId,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        loop {
            let popped = match state.branches.get_mut(&id) {
                None => return,
                Some(branch) => branch.frames.pop(),
            };
            let Some(frame) = popped else {
                state.branches.remove(&id);
                return;
            };
            match frame.kind {
                FrameKind::Retry { .. } => {
                    self.close_block(state, id, frame.enter);
                }
                FrameKind::Resource { resource, key } => {
                    self.release_binding(state, id, &resource, &key, actions, events);
                    self.close_block(state, id, frame.enter);
                }
                FrameKind::Branch { join, .. } => {
                    self.finish_branch_into_join(state, id, join, None, true, actions, events);
                    return;
                }
                FrameKind::Root => {
                    state.branches.remove(&id);
                    return;
                }
            }
        }
    }

    /// Record a branch's terminal state at its join; the last arrival
    /// collapses all branch heads into the single exit node
    #[allow(clippy::too_many_arguments)]
    fn finish_branch_into_join(
        &self,
        state: &mut State,
        id: BranchId,
        join_id: JoinId,
        failure: Option<StepFailure>,
        interrupted: bool,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        let branch = state.branches.remove(&id).expect("branch exists");
        {
            let Some(join) = state.joins.get_mut(&join_id) else {
                error!(execution = %self.id, join = join_id, "finished branch has no join");
                return;
            };
            join.pending = join.pending.saturating_sub(1);
            join.results.push(BranchResult {
                branch: branch.name.clone(),
                last: branch.head,
                failure: failure.clone(),
                interrupted,
            });
            if join.first_failure.is_none() {
                join.first_failure = failure.clone();
            }
        }

        let (fail_fast, aborting) = {
            let join = &state.joins[&join_id];
            (join.fail_fast, join.aborting)
        };
        if failure.is_some() && fail_fast && !aborting {
            state
                .joins
                .get_mut(&join_id)
                .expect("join exists")
                .aborting = true;
            self.cancel_join_members(state, join_id, actions, events);
        }

        // Cancellation may have unwound idle members and completed the join
        // already
        let Some(join) = state.joins.get(&join_id) else {
            return;
        };
        if join.pending > 0 {
            return;
        }

        // Fan-in: all N heads collapse into the exit node
        let join = state.joins.remove(&join_id).expect("join exists");
        let parents: Vec<NodeId> = join.results.iter().map(|r| r.last).collect();
        let exit = state
            .graph
            .append(parents, NodeKind::BlockEnd { start: join.enter });

        let mut owner = state.parked.remove(&join_id).expect("parallel owner parked");
        owner.head = exit;
        owner.current = None;

        let failed: Vec<(&str, &StepFailure)> = join
            .results
            .iter()
            .filter_map(|r| r.failure.as_ref().map(|f| (r.branch.as_str(), f)))
            .collect();
        let result = if join.aborting {
            let (origin, failure) = failed
                .first()
                .expect("fail-fast join has a first failure");
            BlockResult::Failed {
                failure: (*failure).clone(),
                origin: origin.to_string(),
            }
        } else if failed.is_empty() {
            BlockResult::Success
        } else if failed.len() == 1 {
            BlockResult::Failed {
                failure: failed[0].1.clone(),
                origin: failed[0].0.to_string(),
            }
        } else {
            let messages: Vec<String> = failed.iter().map(|(_, f)| f.to_string()).collect();
            BlockResult::Failed {
                failure: StepFailure::new(
                    "parallel",
                    format!("{} branches failed: {}", failed.len(), messages.join("; ")),
                ),
                origin: owner.name.clone(),
            }
        };

        let owner_id = owner.id;
        if owner.rehydrating {
            // The block result waits for the owner's pickles to resolve
            owner.pending_result = Some(result);
            state.branches.insert(owner_id, owner);
            return;
        }
        let cancelled = owner.cancelled;
        state.branches.insert(owner_id, owner);

        if cancelled {
            self.unwind_cancelled(state, owner_id, actions, events);
            return;
        }
        match result {
            BlockResult::Success => self.advance_branch(state, owner_id, actions, events),
            BlockResult::Failed { failure, origin } => {
                self.fail_branch(state, owner_id, failure, origin, actions, events)
            }
        }
    }

    /// Best-effort cancellation of every branch still running under a join
    fn cancel_join_members(
        &self,
        state: &mut State,
        join_id: JoinId,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        let members: Vec<BranchId> = state
            .branches
            .values()
            .filter(|b| Self::belongs_to_join(state, b, join_id))
            .map(|b| b.id)
            .collect();
        for id in members {
            let (head, idle) = {
                let branch = state.branches.get_mut(&id).expect("branch exists");
                branch.cancelled = true;
                (
                    branch.head,
                    !branch.rehydrating && branch.current.is_none(),
                )
            };
            if let Some(in_flight) = state.in_flight.get(&head) {
                let _ = in_flight.cancel.send(true);
            } else if idle {
                self.unwind_cancelled(state, id, actions, events);
            }
        }
        // Parked owners of nested parallels inside this join stop too
        let parked: Vec<JoinId> = state
            .parked
            .iter()
            .filter(|(_, b)| Self::belongs_to_join(state, b, join_id))
            .map(|(j, _)| *j)
            .collect();
        for j in parked {
            if let Some(owner) = state.parked.get_mut(&j) {
                owner.cancelled = true;
            }
        }
    }

    /// Whether a branch's ancestry chain of parallel frames leads to the join
    fn belongs_to_join(state: &State, branch: &Branch, target: JoinId) -> bool {
        let mut current = branch;
        loop {
            match current.frames.first() {
                Some(Frame {
                    kind: FrameKind::Branch { join, .. },
                    ..
                }) => {
                    if *join == target {
                        return true;
                    }
                    match state.parked.get(join) {
                        Some(owner) => current = owner,
                        None => return false,
                    }
                }
                _ => return false,
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion handling
    // ------------------------------------------------------------------

    fn defer_completion(&self, state: &mut State, node: NodeId, completion: Completion) {
        match completion {
            Completion::Step(outcome) => {
                state.deferred.push_back(DeferredTick::Step { node, outcome });
            }
            Completion::Acquired(handle) => {
                // The handle is live now; bind it, but advance only on
                // unpause
                let Some(id) = state.branch_id_at(node) else { return };
                let branch = state.branches.get_mut(&id).expect("branch exists");
                if matches!(branch.current, Some(CurrentWork::Acquire { .. })) {
                    if let Some(CurrentWork::Acquire { key, .. }) = branch.current.take() {
                        branch.bindings.insert(key, Binding::Live(handle));
                        state.deferred.push_back(DeferredTick::Advance { branch: id });
                    }
                }
            }
            Completion::AcquireFailed(failure) => {
                state
                    .deferred
                    .push_back(DeferredTick::AcquireFailed { node, failure });
            }
            Completion::AcquireInterrupted => {
                state.deferred.push_back(DeferredTick::AcquireFailed {
                    node,
                    failure: StepFailure::new("resource", "acquisition interrupted"),
                });
            }
        }
    }

    fn apply_completion(
        &self,
        state: &mut State,
        node: NodeId,
        completion: Completion,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        let Some(id) = state.branch_id_at(node) else {
            debug!(%node, "completion for a branch that no longer exists");
            return;
        };
        match completion {
            Completion::Step(outcome) => {
                let call = {
                    let branch = state.branches.get_mut(&id).expect("branch exists");
                    match branch.current.take() {
                        Some(CurrentWork::Step { call }) => call,
                        other => {
                            branch.current = other;
                            debug!(%node, "step completion without current step work");
                            return;
                        }
                    }
                };
                let success = outcome.is_success();
                let head = state.branches[&id].head;
                let name = state.branches[&id].name.clone();
                let end = state.graph.append(
                    vec![head],
                    NodeKind::StepEnd {
                        step: call.name.clone(),
                        start: node,
                        success,
                    },
                );
                state.branches.get_mut(&id).expect("branch exists").head = end;
                events.push(FlowEvent::StepCompleted {
                    node: end,
                    step: call.name.clone(),
                    branch: name,
                    success,
                });
                match outcome {
                    StepOutcome::Success(_) => self.advance_branch(state, id, actions, events),
                    StepOutcome::Failure(failure) => {
                        let origin = state.branches[&id].name.clone();
                        self.fail_branch(state, id, failure, origin, actions, events)
                    }
                    StepOutcome::Interrupted => {
                        if state.branches[&id].cancelled {
                            self.unwind_cancelled(state, id, actions, events);
                        } else {
                            let origin = state.branches[&id].name.clone();
                            self.fail_branch(
                                state,
                                id,
                                StepFailure::new(call.name, "interrupted"),
                                origin,
                                actions,
                                events,
                            );
                        }
                    }
                }
            }
            Completion::Acquired(handle) => {
                let resource = {
                    let branch = state.branches.get_mut(&id).expect("branch exists");
                    match branch.current.take() {
                        Some(CurrentWork::Acquire { resource, key }) => {
                            branch.bindings.insert(key, Binding::Live(handle));
                            resource
                        }
                        other => {
                            branch.current = other;
                            debug!(%node, "acquisition completion without acquire work");
                            return;
                        }
                    }
                };
                let name = state.branches[&id].name.clone();
                events.push(FlowEvent::ResourceAcquired {
                    node,
                    resource,
                    branch: name,
                });
                if state.branches[&id].cancelled {
                    self.unwind_cancelled(state, id, actions, events);
                } else {
                    self.advance_branch(state, id, actions, events);
                }
            }
            Completion::AcquireFailed(failure) => {
                self.abandon_acquisition(state, id);
                if state.branches[&id].cancelled {
                    self.unwind_cancelled(state, id, actions, events);
                } else {
                    let origin = state.branches[&id].name.clone();
                    self.fail_branch(state, id, failure, origin, actions, events);
                }
            }
            Completion::AcquireInterrupted => {
                self.abandon_acquisition(state, id);
                if state.branches[&id].cancelled {
                    self.unwind_cancelled(state, id, actions, events);
                } else {
                    let origin = state.branches[&id].name.clone();
                    self.fail_branch(
                        state,
                        id,
                        StepFailure::new("resource", "acquisition interrupted"),
                        origin,
                        actions,
                        events,
                    );
                }
            }
        }
    }

    /// Close a resource block whose acquisition never completed; there is no
    /// handle to release
    fn abandon_acquisition(&self, state: &mut State, id: BranchId) {
        let enter = {
            let branch = state.branches.get_mut(&id).expect("branch exists");
            branch.current = None;
            branch
                .frames
                .pop()
                .expect("resource frame present")
                .enter
        };
        self.close_block(state, id, enter);
    }

    /// Dispatch branches whose suspended work lost its worker task (after a
    /// restore or an unpause)
    fn redispatch_idle(
        &self,
        state: &mut State,
        actions: &mut Vec<DispatchAction>,
        events: &mut Vec<FlowEvent>,
    ) {
        // Nodes this mutation has already dispatched (deferred-tick replay)
        let staged_nodes: HashSet<NodeId> = actions
            .iter()
            .filter_map(|a| match a {
                DispatchAction::RunStep { node, .. } | DispatchAction::Acquire { node, .. } => {
                    Some(*node)
                }
                _ => None,
            })
            .collect();
        let idle: Vec<BranchId> = state
            .branches
            .values()
            .filter(|b| {
                !b.rehydrating
                    && !state.in_flight.contains_key(&b.head)
                    && !state.has_deferred_for(b.head)
                    && !staged_nodes.contains(&b.head)
            })
            .map(|b| b.id)
            .collect();
        for id in idle {
            if !state.branches.contains_key(&id) {
                continue;
            }
            if state.branches[&id].cancelled {
                self.unwind_cancelled(state, id, actions, events);
                continue;
            }
            if state.branches[&id].current.is_some() {
                self.push_current_dispatch(state, id, actions);
            } else {
                // Never dispatched (paused before its first step); interpret
                // from where the frames left off
                self.advance_branch(state, id, actions, events);
            }
        }
    }

    fn push_current_dispatch(&self, state: &State, id: BranchId, actions: &mut Vec<DispatchAction>) {
        let branch = &state.branches[&id];
        match &branch.current {
            Some(CurrentWork::Step { call }) => actions.push(DispatchAction::RunStep {
                node: branch.head,
                branch: id,
                branch_name: branch.name.clone(),
                call: call.clone(),
                bindings: branch.value_bindings(),
            }),
            Some(CurrentWork::Acquire { resource, .. }) => actions.push(DispatchAction::Acquire {
                node: branch.head,
                branch: id,
                resource: resource.clone(),
            }),
            None => {}
        }
    }

    // ------------------------------------------------------------------
    // Rehydration
    // ------------------------------------------------------------------

    fn spawn_rehydration(
        &self,
        branch: BranchId,
        branch_name: String,
        pickled: Vec<(String, PickleDescriptor)>,
    ) {
        let engine = self.strong();
        let mut abort_rx = self.abort.subscribe();
        tokio::spawn(async move {
            let mut restored: Vec<(String, Arc<dyn LiveObject>)> = Vec::new();
            for (key, descriptor) in pickled {
                loop {
                    if *abort_rx.borrow() {
                        return;
                    }
                    let factory = engine.pickles.factory(&descriptor.tag);
                    let attempt = match &factory {
                        Some(factory) => {
                            factory.rehydrate(&descriptor, engine.owner.as_ref()).await
                        }
                        None => None,
                    };
                    match attempt {
                        Some(live) => {
                            restored.push((key.clone(), live));
                            break;
                        }
                        None => {
                            let message = factory
                                .map(|f| f.waiting_message(&descriptor))
                                .unwrap_or_else(|| {
                                    format!("No pickle factory registered for `{}`", descriptor.tag)
                                });
                            warn!(branch = %branch_name, "{}", message);
                            engine.emit(vec![FlowEvent::RehydrationWaiting {
                                branch: branch_name.clone(),
                                message,
                            }]);
                            tokio::select! {
                                _ = tokio::time::sleep(engine.rehydration_interval) => {}
                                _ = abort_rx.changed() => {
                                    if *abort_rx.borrow() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            if let Err(err) = engine.finish_rehydration(branch, restored).await {
                error!(branch, %err, "post-rehydration dispatch failed");
            }
        });
    }

    /// Swap rehydrated objects back into the branch and unblock it
    async fn finish_rehydration(
        &self,
        id: BranchId,
        restored: Vec<(String, Arc<dyn LiveObject>)>,
    ) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        if guard.status.is_terminal() {
            return Ok(());
        }
        let events = self
            .staged(&mut guard, move |engine, state, actions, events| {
                // The branch may be live or parked behind a parallel join
                let live = state.branches.contains_key(&id);
                {
                    let branch = if live {
                        state.branches.get_mut(&id)
                    } else {
                        state.parked.values_mut().find(|b| b.id == id)
                    };
                    let Some(branch) = branch else {
                        return StagedOutcome::Skip;
                    };
                    for (key, handle) in restored {
                        branch.bindings.insert(key, Binding::Live(handle));
                    }
                    branch.rehydrating = false;
                    debug!(branch = %branch.name, "rehydration complete");
                }

                if !live {
                    return StagedOutcome::Skip;
                }
                if state.branches[&id].cancelled {
                    engine.unwind_cancelled(state, id, actions, events);
                    return StagedOutcome::Persist;
                }
                if let Some(result) = state
                    .branches
                    .get_mut(&id)
                    .and_then(|b| b.pending_result.take())
                {
                    match result {
                        BlockResult::Success => engine.advance_branch(state, id, actions, events),
                        BlockResult::Failed { failure, origin } => {
                            engine.fail_branch(state, id, failure, origin, actions, events)
                        }
                    }
                    return StagedOutcome::Persist;
                }
                if !state.paused
                    && state.branches[&id].current.is_some()
                    && !state.in_flight.contains_key(&state.branches[&id].head)
                    && !state.has_deferred_for(state.branches[&id].head)
                {
                    engine.push_current_dispatch(state, id, actions);
                }
                StagedOutcome::Skip
            })
            .await?;
        drop(guard);
        self.notify_ready();
        self.emit(events);
        Ok(())
    }
}
