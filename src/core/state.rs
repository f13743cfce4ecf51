//! Execution lifecycle states and outcomes

use serde::{Deserialize, Serialize};

/// Lifecycle state of a `FlowExecution`
///
/// `New → Running ⇄ Paused → Complete`; `Running/Paused → Aborted` on a
/// fatal interrupt. `Complete` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Execution has not started
    New,
    /// Execution is dispatching and ticking
    Running,
    /// Dispatch is suspended; in-flight steps have drained
    Paused,
    /// Execution finished (successfully or with a recorded failure)
    Complete,
    /// Execution was terminated by interrupt or engine fault
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Complete | ExecutionStatus::Aborted)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::New => "New",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Paused => "Paused",
            ExecutionStatus::Complete => "Complete",
            ExecutionStatus::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// Business failure inside a step; interpreted by the nearest enclosing block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("step `{step}` failed: {message}")]
pub struct StepFailure {
    /// Step function name that originated the failure
    pub step: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Result of one leaf step (or resource acquisition)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success(serde_json::Value),
    Failure(StepFailure),
    /// The step honored a cancellation signal before finishing
    Interrupted,
}

impl StepOutcome {
    pub fn success() -> Self {
        StepOutcome::Success(serde_json::Value::Null)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }
}

/// Final result of a whole execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowOutcome {
    Success,
    /// An uncaught step failure, with the branch it originated on
    Failed { failure: StepFailure, branch: String },
    Aborted { reason: String },
}
