//! Test: rehydration blocks only the affected branch; an unrecoverable
//! pickle stalls with a repeating diagnostic until an external interrupt

use crate::helpers::*;
use async_trait::async_trait;
use flowline::execution::{BuiltinRunner, CancelSignal, GateController, ResourceProvider};
use flowline::persistence::{CheckpointStore, ExecutionOwner};
use flowline::pickle::{LiveObject, PickleDescriptor, PickleFactory, PickleRegistry};
use flowline::{
    ExecutionStatus, FlowConfig, FlowExecution, FlowOutcome, Script, StepFailure, StoreOwner,
};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SESSION_TAG: &str = "remote-session";

/// A live reference to something that will not exist after a restart
#[derive(Debug)]
struct RemoteSession;

impl LiveObject for RemoteSession {
    fn tag(&self) -> &str {
        SESSION_TAG
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RemoteProvider;

#[async_trait]
impl ResourceProvider for RemoteProvider {
    async fn acquire(
        &self,
        _resource: &str,
        _cancel: CancelSignal,
    ) -> Result<Arc<dyn LiveObject>, StepFailure> {
        Ok(Arc::new(RemoteSession))
    }

    async fn release(&self, _handle: Arc<dyn LiveObject>) {}
}

/// Pickles fine; never rehydrates
struct AbsentFactory;

#[async_trait]
impl PickleFactory for AbsentFactory {
    fn pickle(&self, _live: &Arc<dyn LiveObject>) -> Option<PickleDescriptor> {
        Some(PickleDescriptor::new(SESSION_TAG, serde_json::Value::Null))
    }

    async fn rehydrate(
        &self,
        _descriptor: &PickleDescriptor,
        _owner: &dyn ExecutionOwner,
    ) -> Option<Arc<dyn LiveObject>> {
        None
    }

    fn waiting_message(&self, _descriptor: &PickleDescriptor) -> String {
        "Cannot restore remote session".to_string()
    }
}

fn remote_config() -> (FlowConfig, GateController) {
    let gates = GateController::new();
    let mut pickles = PickleRegistry::new();
    pickles.register(SESSION_TAG, Arc::new(AbsentFactory));
    let config = FlowConfig {
        runner: Arc::new(BuiltinRunner::new(gates.clone())),
        resources: Arc::new(RemoteProvider),
        pickles: Arc::new(pickles),
        rehydration_interval: Duration::from_millis(25),
    };
    (config, gates)
}

fn stalling_script() -> Script {
    Script::new(
        "remote work",
        vec![parallel(
            vec![
                ("a", vec![resource("remote", vec![gate("six")])]),
                ("b", vec![gate("seven")]),
            ],
            false,
        )],
    )
}

#[tokio::test]
async fn test_unrecoverable_pickle_blocks_only_its_branch() {
    let store = Arc::new(flowline::InMemoryCheckpointStore::new());
    let id = Uuid::new_v4();
    let owner = Arc::new(StoreOwner::new(
        id,
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    ));
    let (config, gates) = remote_config();
    let execution = FlowExecution::new(stalling_script(), owner, config);
    execution.start().await.unwrap();

    gates.wait_for_arrival("six/1").await;
    gates.wait_for_arrival("seven/1").await;

    // Restart: branch a's session pickle can never be rehydrated
    let owner = Arc::new(StoreOwner::new(
        id,
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    ));
    let (config, gates) = remote_config();
    let restored = FlowExecution::load(owner, config).await.unwrap();
    let log = EventLog::attach(&restored);
    restored.resume().await.unwrap();

    // Branch b is unaffected and re-dispatches its gate
    gates.wait_for_arrival("seven/1").await;
    assert!(!gates.has_arrived("six/1"));

    // The diagnostic repeats on the retry interval
    log.wait_rehydration_waits(3).await;
    assert!(log
        .rehydration_waits()
        .iter()
        .all(|m| m.contains("Cannot restore remote session")));

    // Branch b can even finish; the execution stays in progress
    gates.release("seven/1", serde_json::Value::Null);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(restored.status().await, ExecutionStatus::Running);
    assert!(!gates.has_arrived("six/1"));

    // Only an explicit interrupt ends the stalled execution
    restored.interrupt("operator gave up").await.unwrap();
    wait_for_status(&restored, ExecutionStatus::Aborted).await;
    assert_eq!(
        restored.outcome().await,
        Some(FlowOutcome::Aborted {
            reason: "operator gave up".to_string()
        })
    );
}

#[tokio::test]
async fn test_recoverable_pickle_resumes_the_branch() {
    // The standard lease factory re-acquires on resume
    let script = Script::new("leased", vec![resource("build", vec![gate("inner")])]);
    let h = launch(script).await;
    h.arrive("inner/1").await;

    let h = reload(&h).await;
    h.arrive("inner/1").await;
    h.assert_active(&["resource {}", "gate"]).await;
    h.release("inner/1");
    h.wait_status(ExecutionStatus::Complete).await;
    assert_eq!(h.outcome().await, Some(FlowOutcome::Success));
}
