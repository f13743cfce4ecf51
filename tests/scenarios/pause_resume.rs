//! Test: pause lets in-flight steps finish but dispatches nothing new

use crate::helpers::*;
use flowline::{ExecutionStatus, FlowOutcome, Script};

#[tokio::test]
async fn test_pause_defers_dispatch_until_unpause() {
    let script = Script::new("pausable", vec![echo("before"), gate("one"), gate("two")]);
    let h = launch(script).await;

    h.arrive("one/1").await;
    h.execution.pause(true).await.unwrap();

    // The in-flight gate is allowed to finish...
    h.release("one/1");
    h.wait_status(ExecutionStatus::Paused).await;

    // ...but its successor is not dispatched
    assert!(!h.gates.has_arrived("two/1"));
    assert!(!h.execution.status().await.is_terminal());

    h.execution.pause(false).await.unwrap();
    h.arrive("two/1").await;
    h.release("two/1");

    h.wait_status(ExecutionStatus::Complete).await;
    assert_eq!(h.outcome().await, Some(FlowOutcome::Success));
}

#[tokio::test]
async fn test_pause_is_idempotent() {
    let script = Script::new("pausable", vec![gate("one")]);
    let h = launch(script).await;
    h.arrive("one/1").await;

    h.execution.pause(true).await.unwrap();
    h.execution.pause(true).await.unwrap();
    h.release("one/1");
    h.wait_status(ExecutionStatus::Paused).await;

    h.execution.pause(false).await.unwrap();
    h.execution.pause(false).await.unwrap();
    h.wait_status(ExecutionStatus::Complete).await;
}

#[tokio::test]
async fn test_pause_before_start_holds_first_dispatch() {
    let script = Script::new("pausable", vec![gate("one")]);
    let store = std::sync::Arc::new(flowline::InMemoryCheckpointStore::new());
    let owner = std::sync::Arc::new(flowline::StoreOwner::new(
        uuid::Uuid::new_v4(),
        std::sync::Arc::clone(&store) as std::sync::Arc<dyn flowline::CheckpointStore>,
    ));
    let (config, gates) = test_config();
    let execution = flowline::FlowExecution::new(script, owner, config);

    execution.pause(true).await.unwrap();
    execution.start().await.unwrap();
    wait_for_status(&execution, ExecutionStatus::Paused).await;
    assert!(!gates.has_arrived("one/1"));

    execution.pause(false).await.unwrap();
    gates.wait_for_arrival("one/1").await;
    gates.release("one/1", serde_json::Value::Null);
    wait_for_status(&execution, ExecutionStatus::Complete).await;
}

#[tokio::test]
async fn test_paused_execution_survives_restart() {
    let script = Script::new("pausable", vec![gate("one"), gate("two")]);
    let h = launch(script).await;

    h.arrive("one/1").await;
    h.execution.pause(true).await.unwrap();
    h.release("one/1");
    h.wait_status(ExecutionStatus::Paused).await;

    // Restart while paused: the deferred completion is in the checkpoint
    let h = reload(&h).await;
    assert_eq!(h.execution.status().await, ExecutionStatus::Paused);
    assert!(!h.gates.has_arrived("two/1"));

    h.execution.pause(false).await.unwrap();
    h.arrive("two/1").await;
    h.release("two/1");
    h.wait_status(ExecutionStatus::Complete).await;
    assert_eq!(h.outcome().await, Some(FlowOutcome::Success));
}
