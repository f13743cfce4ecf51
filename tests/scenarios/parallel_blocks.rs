//! Test: parallel block fan-out/fan-in, fail-fast and wait-all policies

use crate::helpers::*;
use flowline::{ExecutionStatus, FlowOutcome, Script};

#[tokio::test]
async fn test_parallel_success_joins_and_continues() {
    let script = Script::new(
        "fanout",
        vec![
            parallel(vec![("a", vec![gate("ga")]), ("b", vec![gate("gb")])], false),
            gate("after"),
        ],
    );
    let h = launch(script).await;

    h.arrive("ga/1").await;
    h.arrive("gb/1").await;
    h.release("ga/1");
    h.release("gb/1");

    h.arrive("after/1").await;
    h.assert_active(&["gate"]).await;
    h.release("after/1");
    h.wait_status(ExecutionStatus::Complete).await;
    assert_eq!(h.outcome().await, Some(FlowOutcome::Success));
}

#[tokio::test]
async fn test_fail_fast_cancels_the_other_branches() {
    let script = Script::new(
        "fanout",
        vec![parallel(
            vec![("a", vec![gate("ga")]), ("b", vec![gate("gb")])],
            true,
        )],
    );
    let h = launch(script).await;

    h.arrive("ga/1").await;
    h.arrive("gb/1").await;
    h.fail_gate("ga/1", "boom");

    // Branch b is cancelled, never released by the test
    h.wait_status(ExecutionStatus::Complete).await;
    match h.outcome().await {
        Some(FlowOutcome::Failed { failure, branch }) => {
            assert_eq!(failure.message, "boom");
            assert_eq!(branch, "a");
        }
        other => panic!("Expected failed outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_all_lets_the_other_branch_finish() {
    let script = Script::new(
        "fanout",
        vec![parallel(
            vec![("a", vec![gate("ga")]), ("b", vec![gate("gb")])],
            false,
        )],
    );
    let h = launch(script).await;

    h.arrive("ga/1").await;
    h.arrive("gb/1").await;
    h.fail_gate("ga/1", "boom");

    // Without fail-fast the block waits for branch b
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.execution.status().await, ExecutionStatus::Running);

    h.release("gb/1");
    h.wait_status(ExecutionStatus::Complete).await;
    match h.outcome().await {
        Some(FlowOutcome::Failed { failure, branch }) => {
            assert_eq!(failure.message, "boom");
            assert_eq!(branch, "a");
        }
        other => panic!("Expected failed outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_all_aggregates_multiple_failures() {
    let script = Script::new(
        "fanout",
        vec![parallel(
            vec![("a", vec![gate("ga")]), ("b", vec![gate("gb")])],
            false,
        )],
    );
    let h = launch(script).await;

    h.arrive("ga/1").await;
    h.arrive("gb/1").await;
    h.fail_gate("ga/1", "boom-a");
    h.fail_gate("gb/1", "boom-b");

    h.wait_status(ExecutionStatus::Complete).await;
    match h.outcome().await {
        Some(FlowOutcome::Failed { failure, .. }) => {
            assert!(failure.message.contains("2 branches failed"));
            assert!(failure.message.contains("boom-a"));
            assert!(failure.message.contains("boom-b"));
        }
        other => panic!("Expected failed outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_nested_parallel_blocks() {
    let script = Script::new(
        "nested",
        vec![parallel(
            vec![
                (
                    "outer",
                    vec![parallel(
                        vec![("x", vec![gate("gx")]), ("y", vec![gate("gy")])],
                        false,
                    )],
                ),
                ("flat", vec![gate("gf")]),
            ],
            false,
        )],
    );
    let h = launch(script).await;

    h.arrive("gx/1").await;
    h.arrive("gy/1").await;
    h.arrive("gf/1").await;

    // Three leaves; the nested parallel appears once, after the outer one
    h.assert_active(&["parallel {}", "parallel {}", "gate", "gate", "gate"])
        .await;

    h.release("gx/1");
    h.release("gy/1");
    h.release("gf/1");
    h.wait_status(ExecutionStatus::Complete).await;
    assert_eq!(h.outcome().await, Some(FlowOutcome::Success));
}
