//! Test utility functions for flowline

#![allow(dead_code)]

use flowline::core::script::{ParallelBranch, Script, Statement, StepCall};
use flowline::execution::{FlowConfig, FlowExecution, FlowEvent, GateController};
use flowline::persistence::{CheckpointStore, InMemoryCheckpointStore, StoreOwner};
use flowline::{ExecutionStatus, FlowOutcome, StepFailure};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(10);

pub fn echo(message: &str) -> Statement {
    Statement::Step(StepCall::new("echo").with_arg("message", message))
}

pub fn gate(name: &str) -> Statement {
    Statement::Step(StepCall::new("gate").with_arg("name", name))
}

pub fn retry(attempts: u32, body: Vec<Statement>) -> Statement {
    Statement::Retry { attempts, body }
}

pub fn resource(name: &str, body: Vec<Statement>) -> Statement {
    Statement::Resource {
        resource: name.to_string(),
        body,
    }
}

pub fn parallel(branches: Vec<(&str, Vec<Statement>)>, fail_fast: bool) -> Statement {
    Statement::Parallel {
        branches: branches
            .into_iter()
            .map(|(name, body)| ParallelBranch {
                name: name.to_string(),
                body,
            })
            .collect(),
        fail_fast,
    }
}

/// Standard engine collaborators with a test-friendly rehydration interval
pub fn test_config() -> (FlowConfig, GateController) {
    let (mut config, gates) = FlowConfig::standard();
    config.rehydration_interval = Duration::from_millis(25);
    (config, gates)
}

/// A started execution plus the handles the tests drive it with
pub struct Harness {
    pub execution: Arc<FlowExecution>,
    pub gates: GateController,
    pub store: Arc<InMemoryCheckpointStore>,
    pub id: Uuid,
}

/// Start a script against an in-memory checkpoint store
pub async fn launch(script: Script) -> Harness {
    let store = Arc::new(InMemoryCheckpointStore::new());
    launch_with_store(script, store).await
}

pub async fn launch_with_store(script: Script, store: Arc<InMemoryCheckpointStore>) -> Harness {
    let id = Uuid::new_v4();
    let owner = Arc::new(StoreOwner::new(
        id,
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    ));
    let (config, gates) = test_config();
    let execution = FlowExecution::new(script, owner, config);
    execution.start().await.expect("execution should start");
    Harness {
        execution,
        gates,
        store,
        id,
    }
}

/// Simulate a restart: load the latest checkpoint into a fresh engine with
/// fresh collaborators (new gate controller, new resource provider) and
/// resume it
pub async fn reload(harness: &Harness) -> Harness {
    let owner = Arc::new(StoreOwner::new(
        harness.id,
        Arc::clone(&harness.store) as Arc<dyn CheckpointStore>,
    ));
    let (config, gates) = test_config();
    let execution = FlowExecution::load(owner, config)
        .await
        .expect("checkpoint should load");
    execution.resume().await.expect("execution should resume");
    Harness {
        execution,
        gates,
        store: Arc::clone(&harness.store),
        id: harness.id,
    }
}

impl Harness {
    /// Wait until a gate step suspends at the given `name/occurrence` key
    pub async fn arrive(&self, key: &str) {
        timeout(WAIT, self.gates.wait_for_arrival(key))
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for gate `{}`", key));
    }

    pub fn release(&self, key: &str) {
        self.gates.release(key, serde_json::Value::Null);
    }

    pub fn fail_gate(&self, key: &str, message: &str) {
        self.gates.fail(key, StepFailure::new("gate", message));
    }

    /// Assert the currently-active chain, in the reference notation: block
    /// labels with `{}`, leaf step names bare
    pub async fn assert_active(&self, expected: &[&str]) {
        assert_step_executions(&self.execution, expected).await;
    }

    pub async fn wait_status(&self, want: ExecutionStatus) {
        wait_for_status(&self.execution, want).await;
    }

    pub async fn outcome(&self) -> Option<FlowOutcome> {
        self.execution.outcome().await
    }
}

/// The core `current_executions` contract: the innermost set is exactly the
/// tail of the full chain, and the full chain matches `expected`
pub async fn assert_step_executions(execution: &Arc<FlowExecution>, expected: &[&str]) {
    let current = execution.current_executions(true).await;
    let all = execution.current_executions(false).await;

    let block_count = all.len() - current.len();
    assert_eq!(
        current,
        all[block_count..].to_vec(),
        "innermost executions were not the tail of the full chain"
    );

    let labels: Vec<String> = all.iter().map(|h| h.label()).collect();
    let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    assert_eq!(labels, expected);
}

pub async fn wait_for_status(execution: &Arc<FlowExecution>, want: ExecutionStatus) {
    let mut rx = execution.status_watch();
    let result = timeout(WAIT, async {
        loop {
            if execution.status().await == want {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("Status channel closed before reaching {:?}", want);
            }
        }
    })
    .await;
    if result.is_err() {
        panic!(
            "Timed out waiting for status {:?}, currently {:?}",
            want,
            execution.status().await
        );
    }
}

/// Poll a condition until it holds
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let result = timeout(WAIT, async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if result.is_err() {
        panic!("Timed out waiting for {}", what);
    }
}

/// Captures flow events for later assertions
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<FlowEvent>>>,
}

impl EventLog {
    pub fn attach(execution: &Arc<FlowExecution>) -> Self {
        let log = Self {
            events: Arc::new(Mutex::new(Vec::new())),
        };
        let events = Arc::clone(&log.events);
        execution.add_event_handler(move |event| {
            events.lock().expect("event log poisoned").push(event);
        });
        log
    }

    pub fn snapshot(&self) -> Vec<FlowEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    pub fn rehydration_waits(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::RehydrationWaiting { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn started_steps(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::StepStarted { step, .. } => Some(step),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `n` rehydration diagnostics have been emitted
    pub async fn wait_rehydration_waits(&self, n: usize) {
        eventually("repeated rehydration diagnostics", || {
            self.rehydration_waits().len() >= n
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_runs_simple_script() {
        let script = Script::new("simple", vec![echo("hello")]);
        let harness = launch(script).await;
        harness.wait_status(ExecutionStatus::Complete).await;
        assert_eq!(harness.outcome().await, Some(FlowOutcome::Success));
    }

    #[tokio::test]
    async fn test_gate_helpers_drive_a_gate() {
        let script = Script::new("gated", vec![gate("go")]);
        let harness = launch(script).await;
        harness.arrive("go/1").await;
        harness.assert_active(&["gate"]).await;
        harness.release("go/1");
        harness.wait_status(ExecutionStatus::Complete).await;
    }
}
