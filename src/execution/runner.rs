//! Step runner seam - how leaf steps actually execute
//!
//! The engine is generic over a `StepRunner`; the built-in runner covers the
//! `echo`, `sleep` and `gate` steps and can delegate unknown names to a
//! custom runner.

use crate::core::graph::NodeId;
use crate::core::script::StepCall;
use crate::core::state::{StepFailure, StepOutcome};
use crate::execution::gate::GateController;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Best-effort cancellation signal handed to every running step
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A signal that never fires; for contexts without an engine behind them
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&mut self) {
        match &mut self.rx {
            None => std::future::pending().await,
            Some(rx) => loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Engine side dropped; treat as cancelled
                    return;
                }
            },
        }
    }
}

/// Per-dispatch context for a step run
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    /// Flow node recording this step's start
    pub node: NodeId,
    /// Branch the step runs on
    pub branch: String,
    /// Plain-value view of the branch bindings
    pub bindings: BTreeMap<String, serde_json::Value>,
    pub cancel: CancelSignal,
}

/// Trait for leaf step execution - allows for different implementations
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run the step to completion (or to a cancellation)
    async fn run(&self, call: &StepCall, ctx: StepContext) -> StepOutcome;
}

/// Built-in step vocabulary: `echo`, `sleep`, `gate`
pub struct BuiltinRunner {
    gates: GateController,
    fallback: Option<Arc<dyn StepRunner>>,
}

impl BuiltinRunner {
    pub fn new(gates: GateController) -> Self {
        Self {
            gates,
            fallback: None,
        }
    }

    /// Delegate step names the built-ins don't know to another runner
    pub fn with_fallback(mut self, fallback: Arc<dyn StepRunner>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn gates(&self) -> GateController {
        self.gates.clone()
    }

    async fn run_gate(&self, call: &StepCall, mut ctx: StepContext) -> StepOutcome {
        let Some(name) = call.str_arg("name") else {
            return StepOutcome::Failure(StepFailure::new("gate", "missing `name` argument"));
        };
        let (key, rx) = self.gates.arrive(name);
        info!(gate = %key, branch = %ctx.branch, "gate waiting");
        tokio::select! {
            outcome = rx => outcome.unwrap_or(StepOutcome::Interrupted),
            _ = ctx.cancel.cancelled() => StepOutcome::Interrupted,
        }
    }

    async fn run_sleep(&self, call: &StepCall, mut ctx: StepContext) -> StepOutcome {
        let millis = call
            .int_arg("millis")
            .or_else(|| call.int_arg("secs").map(|s| s * 1000))
            .unwrap_or(0)
            .max(0) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => StepOutcome::success(),
            _ = ctx.cancel.cancelled() => StepOutcome::Interrupted,
        }
    }
}

#[async_trait]
impl StepRunner for BuiltinRunner {
    async fn run(&self, call: &StepCall, ctx: StepContext) -> StepOutcome {
        match call.name.as_str() {
            "echo" => {
                let message = call.str_arg("message").unwrap_or_default().to_string();
                info!(branch = %ctx.branch, "{}", message);
                StepOutcome::Success(serde_json::Value::String(message))
            }
            "sleep" => self.run_sleep(call, ctx).await,
            "gate" => self.run_gate(call, ctx).await,
            other => match &self.fallback {
                Some(runner) => runner.run(call, ctx).await,
                None => StepOutcome::Failure(StepFailure::new(
                    other,
                    format!("unknown step `{}`", other),
                )),
            },
        }
    }
}
