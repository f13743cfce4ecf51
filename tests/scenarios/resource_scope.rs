//! Test: scoped resource acquisition - release on every exit path

use crate::helpers::*;
use async_trait::async_trait;
use flowline::execution::{
    BuiltinRunner, CancelSignal, GateController, LeasePickleFactory, LocalResourceProvider,
    ResourceProvider, LOCAL_LEASE_TAG,
};
use flowline::persistence::CheckpointStore;
use flowline::pickle::{LiveObject, PickleRegistry};
use flowline::{
    ExecutionStatus, FlowConfig, FlowExecution, FlowOutcome, Script, StepFailure, StoreOwner,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Rig {
    execution: Arc<FlowExecution>,
    gates: GateController,
    provider: Arc<LocalResourceProvider>,
}

async fn launch_with_provider(script: Script) -> Rig {
    let provider = Arc::new(LocalResourceProvider::new());
    let gates = GateController::new();
    let mut pickles = PickleRegistry::new();
    pickles.register(
        LOCAL_LEASE_TAG,
        Arc::new(LeasePickleFactory::new(Arc::clone(&provider))),
    );
    let config = FlowConfig {
        runner: Arc::new(BuiltinRunner::new(gates.clone())),
        resources: Arc::clone(&provider) as Arc<dyn ResourceProvider>,
        pickles: Arc::new(pickles),
        rehydration_interval: Duration::from_millis(25),
    };
    let store = Arc::new(flowline::InMemoryCheckpointStore::new());
    let owner = Arc::new(StoreOwner::new(
        Uuid::new_v4(),
        store as Arc<dyn CheckpointStore>,
    ));
    let execution = FlowExecution::new(script, owner, config);
    execution.start().await.unwrap();
    Rig {
        execution,
        gates,
        provider,
    }
}

#[tokio::test]
async fn test_release_on_normal_exit() {
    let script = Script::new("scoped", vec![resource("build", vec![gate("work")])]);
    let rig = launch_with_provider(script).await;

    rig.gates.wait_for_arrival("work/1").await;
    assert_eq!(rig.provider.held("build"), 1);

    rig.gates.release("work/1", serde_json::Value::Null);
    wait_for_status(&rig.execution, ExecutionStatus::Complete).await;
    eventually("lease release", || rig.provider.held("build") == 0).await;
}

#[tokio::test]
async fn test_release_on_body_failure() {
    let script = Script::new("scoped", vec![resource("build", vec![gate("work")])]);
    let rig = launch_with_provider(script).await;

    rig.gates.wait_for_arrival("work/1").await;
    rig.gates.fail("work/1", StepFailure::new("gate", "broken"));

    wait_for_status(&rig.execution, ExecutionStatus::Complete).await;
    assert!(matches!(
        rig.execution.outcome().await,
        Some(FlowOutcome::Failed { .. })
    ));
    eventually("lease release", || rig.provider.held("build") == 0).await;
}

#[tokio::test]
async fn test_release_on_interrupt() {
    let script = Script::new("scoped", vec![resource("build", vec![gate("work")])]);
    let rig = launch_with_provider(script).await;

    rig.gates.wait_for_arrival("work/1").await;
    assert_eq!(rig.provider.held("build"), 1);

    rig.execution.interrupt("shutting down").await.unwrap();
    wait_for_status(&rig.execution, ExecutionStatus::Aborted).await;
    eventually("lease release", || rig.provider.held("build") == 0).await;
}

/// Provider whose acquisitions always fail
struct Unavailable;

#[async_trait]
impl ResourceProvider for Unavailable {
    async fn acquire(
        &self,
        resource: &str,
        _cancel: CancelSignal,
    ) -> Result<Arc<dyn LiveObject>, StepFailure> {
        Err(StepFailure::new(
            "resource",
            format!("`{}` is offline", resource),
        ))
    }

    async fn release(&self, _handle: Arc<dyn LiveObject>) {}
}

#[tokio::test]
async fn test_acquisition_failure_fails_the_block() {
    let gates = GateController::new();
    let config = FlowConfig {
        runner: Arc::new(BuiltinRunner::new(gates.clone())),
        resources: Arc::new(Unavailable),
        pickles: Arc::new(PickleRegistry::new()),
        rehydration_interval: Duration::from_millis(25),
    };
    let store = Arc::new(flowline::InMemoryCheckpointStore::new());
    let owner = Arc::new(StoreOwner::new(
        Uuid::new_v4(),
        store as Arc<dyn CheckpointStore>,
    ));
    let script = Script::new("scoped", vec![resource("build", vec![gate("work")])]);
    let execution = FlowExecution::new(script, owner, config);
    execution.start().await.unwrap();

    wait_for_status(&execution, ExecutionStatus::Complete).await;
    match execution.outcome().await {
        Some(FlowOutcome::Failed { failure, .. }) => {
            assert!(failure.message.contains("offline"));
        }
        other => panic!("Expected failed outcome, got {:?}", other),
    }
    assert!(!gates.has_arrived("work/1"));
}

#[tokio::test]
async fn test_retry_reacquires_after_failed_attempt() {
    let script = Script::new(
        "scoped retry",
        vec![retry(2, vec![resource("build", vec![gate("work")])])],
    );
    let rig = launch_with_provider(script).await;

    rig.gates.wait_for_arrival("work/1").await;
    rig.gates.fail("work/1", StepFailure::new("gate", "flaky"));

    rig.gates.wait_for_arrival("work/2").await;
    // A fresh lease for the fresh attempt; the first one is released
    eventually("single live lease", || rig.provider.held("build") == 1).await;

    rig.gates.release("work/2", serde_json::Value::Null);
    wait_for_status(&rig.execution, ExecutionStatus::Complete).await;
    eventually("lease release", || rig.provider.held("build") == 0).await;
}
