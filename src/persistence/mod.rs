//! Checkpoint persistence for executions
//!
//! A checkpoint is a crash-consistent snapshot of the whole execution: the
//! full node set, the active head set (one per live branch, carried by the
//! branch snapshots), the branch continuations, and pickle descriptors for
//! every live object reachable from the heads.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteCheckpointStore;

use crate::core::graph::FlowNode;
use crate::core::script::Script;
use crate::core::state::{ExecutionStatus, FlowOutcome};
use crate::execution::branch::{
    Binding, BlockResult, Branch, BranchId, CurrentWork, DeferredTick, Frame, JoinId, ParallelJoin,
};
use crate::core::graph::NodeId;
use crate::pickle::{PickleDescriptor, PickleError, PickleRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Persistence failure; always fatal to the triggering operation
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Unpicklable(#[from] PickleError),

    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// A binding as it appears in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingSnapshot {
    Value { value: serde_json::Value },
    Pickled { descriptor: PickleDescriptor },
}

/// One branch as it appears in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    pub id: BranchId,
    pub name: String,
    pub head: NodeId,
    pub frames: Vec<Frame>,
    pub bindings: BTreeMap<String, BindingSnapshot>,
    pub current: Option<CurrentWork>,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_result: Option<BlockResult>,
}

impl BranchSnapshot {
    /// Capture a live branch, replacing live objects with their pickles
    pub fn capture(branch: &Branch, pickles: &PickleRegistry) -> Result<Self, PersistError> {
        let mut bindings = BTreeMap::new();
        for (key, binding) in &branch.bindings {
            let snapshot = match binding {
                Binding::Value(value) => BindingSnapshot::Value {
                    value: value.clone(),
                },
                Binding::Live(live) => BindingSnapshot::Pickled {
                    descriptor: pickles.pickle(live)?,
                },
                Binding::Pickled(descriptor) => BindingSnapshot::Pickled {
                    descriptor: descriptor.clone(),
                },
            };
            bindings.insert(key.clone(), snapshot);
        }
        Ok(Self {
            id: branch.id,
            name: branch.name.clone(),
            head: branch.head,
            frames: branch.frames.clone(),
            bindings,
            current: branch.current.clone(),
            cancelled: branch.cancelled,
            pending_result: branch.pending_result.clone(),
        })
    }

    /// Rebuild the runtime branch; pickled bindings stay pickled and mark the
    /// branch as awaiting rehydration
    pub fn restore(self) -> Branch {
        let mut branch = Branch::new(self.id, self.name, self.head, self.frames);
        for (key, snapshot) in self.bindings {
            let binding = match snapshot {
                BindingSnapshot::Value { value } => Binding::Value(value),
                BindingSnapshot::Pickled { descriptor } => Binding::Pickled(descriptor),
            };
            branch.bindings.insert(key, binding);
        }
        branch.current = self.current;
        branch.cancelled = self.cancelled;
        branch.pending_result = self.pending_result;
        branch.rehydrating = branch.bindings.values().any(Binding::is_pickled);
        branch
    }
}

/// Complete persisted state of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub script: Script,
    pub status: ExecutionStatus,
    pub paused: bool,
    pub outcome: Option<FlowOutcome>,
    pub nodes: Vec<FlowNode>,
    /// Live branches; their `head` fields are the active head set
    pub branches: Vec<BranchSnapshot>,
    /// Branches parked while their parallel block runs, keyed by join
    pub parked: Vec<(JoinId, BranchSnapshot)>,
    pub joins: Vec<ParallelJoin>,
    pub next_branch: BranchId,
    pub next_join: JoinId,
    pub deferred: Vec<DeferredTick>,
    pub saved_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    /// The active head set recorded in this snapshot
    pub fn heads(&self) -> Vec<NodeId> {
        self.branches.iter().map(|b| b.head).collect()
    }
}

/// Summary row for history listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub script_name: String,
    pub status: ExecutionStatus,
    pub updated_at: DateTime<Utc>,
    pub node_count: usize,
}

impl ExecutionSummary {
    pub fn of(snapshot: &ExecutionSnapshot) -> Self {
        Self {
            execution_id: snapshot.execution_id,
            script_name: snapshot.script.name.clone(),
            status: snapshot.status,
            updated_at: snapshot.saved_at,
            node_count: snapshot.nodes.len(),
        }
    }
}

/// The persistence/identity handle the engine checkpoints through
#[async_trait]
pub trait ExecutionOwner: Send + Sync {
    fn execution_id(&self) -> Uuid;

    async fn load_checkpoint(&self) -> Result<Option<ExecutionSnapshot>, PersistError>;

    async fn save_checkpoint(&self, snapshot: &ExecutionSnapshot) -> Result<(), PersistError>;
}

/// Trait for checkpoint storage backends
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<(), PersistError>;

    async fn load(&self, execution_id: Uuid) -> Result<Option<ExecutionSnapshot>, PersistError>;

    async fn delete(&self, execution_id: Uuid) -> Result<(), PersistError>;

    async fn list(&self) -> Result<Vec<ExecutionSummary>, PersistError>;
}

/// Owner binding one execution identity to a checkpoint store
pub struct StoreOwner {
    execution_id: Uuid,
    store: Arc<dyn CheckpointStore>,
}

impl StoreOwner {
    pub fn new(execution_id: Uuid, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            execution_id,
            store,
        }
    }
}

#[async_trait]
impl ExecutionOwner for StoreOwner {
    fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    async fn load_checkpoint(&self) -> Result<Option<ExecutionSnapshot>, PersistError> {
        self.store.load(self.execution_id).await
    }

    async fn save_checkpoint(&self, snapshot: &ExecutionSnapshot) -> Result<(), PersistError> {
        self.store.save(snapshot).await
    }
}

/// In-memory checkpoint store (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    snapshots: tokio::sync::RwLock<std::collections::HashMap<Uuid, ExecutionSnapshot>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<(), PersistError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.execution_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<Option<ExecutionSnapshot>, PersistError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&execution_id).cloned())
    }

    async fn delete(&self, execution_id: Uuid) -> Result<(), PersistError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(&execution_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExecutionSummary>, PersistError> {
        let snapshots = self.snapshots.read().await;
        let mut summaries: Vec<_> = snapshots.values().map(ExecutionSummary::of).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
