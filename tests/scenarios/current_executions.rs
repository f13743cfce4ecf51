//! Test: active-execution tracking through nested retry/resource/parallel
//! blocks, across a mid-run restart

use crate::helpers::*;
use flowline::{ExecutionStatus, FlowOutcome, Script};

fn reference_script() -> Script {
    let mut script = Script::new(
        "reference walk",
        vec![
            echo("a step"),
            gate("one"),
            retry(
                2,
                vec![
                    gate("two"),
                    resource("build", vec![gate("three")]),
                    gate("four"),
                ],
            ),
            gate("five"),
            parallel(
                vec![
                    ("a", vec![resource("build", vec![gate("six")])]),
                    ("b", vec![gate("seven")]),
                ],
                false,
            ),
            gate("eight"),
        ],
    );
    script.sandbox = true;
    script
}

#[tokio::test]
async fn test_current_executions_through_nested_blocks() {
    let h = launch(reference_script()).await;

    h.arrive("one/1").await;
    h.assert_active(&["gate"]).await;
    h.release("one/1");

    h.arrive("two/1").await;
    h.assert_active(&["retry {}", "gate"]).await;
    h.release("two/1");

    h.arrive("three/1").await;
    h.assert_active(&["retry {}", "resource {}", "gate"]).await;

    // Restart mid-resource: the lease binding survives as a pickle and is
    // re-acquired on resume
    let h = reload(&h).await;
    assert!(h.execution.is_sandboxed());
    h.arrive("three/1").await;
    h.assert_active(&["retry {}", "resource {}", "gate"]).await;
    h.release("three/1");

    h.arrive("four/1").await;
    h.assert_active(&["retry {}", "gate"]).await;
    h.fail_gate("four/1", "try again");

    // The retry re-enters its body as a fresh region. Gate occurrence
    // numbering restarted with the new controller, so this is the first
    // arrival of `two` since the reload.
    h.arrive("two/1").await;
    h.assert_active(&["retry {}", "gate"]).await;
    h.release("two/1");

    h.arrive("three/2").await;
    h.assert_active(&["retry {}", "resource {}", "gate"]).await;
    h.release("three/2");

    h.arrive("four/2").await;
    h.assert_active(&["retry {}", "gate"]).await;
    h.release("four/2");

    h.arrive("five/1").await;
    h.assert_active(&["gate"]).await;
    h.release("five/1");

    // Two concurrent heads inside the parallel block
    h.arrive("six/1").await;
    h.arrive("seven/1").await;
    h.assert_active(&["parallel {}", "resource {}", "gate", "gate"])
        .await;
    h.release("six/1");
    h.release("seven/1");

    h.arrive("eight/1").await;
    h.assert_active(&["gate"]).await;
    h.release("eight/1");

    h.wait_status(ExecutionStatus::Complete).await;
    assert_eq!(h.outcome().await, Some(FlowOutcome::Success));
    h.assert_active(&[]).await;
}

#[tokio::test]
async fn test_innermost_is_tail_of_full_chain_with_two_branches() {
    let script = Script::new(
        "two branches",
        vec![parallel(
            vec![
                ("a", vec![retry(2, vec![gate("ga")])]),
                ("b", vec![gate("gb")]),
            ],
            false,
        )],
    );
    let h = launch(script).await;
    h.arrive("ga/1").await;
    h.arrive("gb/1").await;

    // assert_active checks the tail property on every call
    h.assert_active(&["parallel {}", "retry {}", "gate", "gate"])
        .await;

    h.release("ga/1");
    h.release("gb/1");
    h.wait_status(ExecutionStatus::Complete).await;
}
