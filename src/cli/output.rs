//! CLI output formatting

use crate::core::state::{ExecutionStatus, FlowOutcome};
use crate::execution::FlowEvent;
use crate::persistence::ExecutionSummary;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::New => style("NEW").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Paused => style("PAUSED").cyan().to_string(),
        ExecutionStatus::Complete => style("COMPLETE").green().to_string(),
        ExecutionStatus::Aborted => style("ABORTED").red().to_string(),
    }
}

/// Format a flow event for console output
pub fn format_flow_event(event: &FlowEvent) -> String {
    match event {
        FlowEvent::ExecutionStarted { script, .. } => {
            format!("{} Started `{}`", ROCKET, style(script).bold())
        }
        FlowEvent::StepStarted { step, branch, .. } => {
            format!("{} {} [{}]", SPINNER, step, style(branch).dim())
        }
        FlowEvent::StepCompleted {
            step,
            branch,
            success,
            ..
        } => {
            let mark = if *success { CHECK } else { CROSS };
            format!("{} {} [{}]", mark, step, style(branch).dim())
        }
        FlowEvent::RetryScheduled {
            branch,
            attempts_left,
            ..
        } => format!(
            "{} Retrying [{}] ({} attempts left)",
            WARN,
            style(branch).dim(),
            attempts_left
        ),
        FlowEvent::BranchStarted { branch, .. } => {
            format!("{} Branch `{}` started", INFO, branch)
        }
        FlowEvent::ResourceAcquired {
            resource, branch, ..
        } => format!(
            "{} Acquired `{}` [{}]",
            INFO,
            resource,
            style(branch).dim()
        ),
        FlowEvent::ResourceReleased { resource, branch } => format!(
            "{} Released `{}` [{}]",
            INFO,
            resource,
            style(branch).dim()
        ),
        FlowEvent::PauseChanged { paused } => {
            if *paused {
                format!("{} Execution paused", INFO)
            } else {
                format!("{} Execution resumed", INFO)
            }
        }
        FlowEvent::RehydrationWaiting { branch, message } => {
            format!("{} {} [{}]", WARN, message, style(branch).dim())
        }
        FlowEvent::ExecutionFinished { outcome, .. } => format_outcome(outcome),
    }
}

/// Format the final outcome
pub fn format_outcome(outcome: &FlowOutcome) -> String {
    match outcome {
        FlowOutcome::Success => format!("{} Execution {}", CHECK, style("succeeded").green()),
        FlowOutcome::Failed { failure, branch } => format!(
            "{} Execution {} on `{}`: {}",
            CROSS,
            style("failed").red(),
            branch,
            failure
        ),
        FlowOutcome::Aborted { reason } => format!(
            "{} Execution {}: {}",
            CROSS,
            style("aborted").red(),
            reason
        ),
    }
}

/// Format a history row
pub fn format_summary(summary: &ExecutionSummary) -> String {
    format!(
        "{}  {}  {}  {} nodes  {}",
        style(&summary.execution_id.to_string()[..8]).dim(),
        format_status(summary.status),
        style(&summary.script_name).bold(),
        summary.node_count,
        style(summary.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()).dim()
    )
}
