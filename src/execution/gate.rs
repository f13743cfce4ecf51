//! External-signal gates - the suspension primitive for human approval and
//! remote completion
//!
//! A `gate` step suspends its branch until something outside the engine
//! releases or fails it. Each arrival of a named gate gets a numbered key
//! (`approve/1`, `approve/2`, ...) so a retry re-entering the same gate is
//! addressable on its own.

use crate::core::state::{StepFailure, StepOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};

#[derive(Default)]
struct Slot {
    /// Set when the gate is signalled; may happen before the step arrives
    outcome: Option<StepOutcome>,
    /// Present while a gate step is suspended on this slot
    waiter: Option<oneshot::Sender<StepOutcome>>,
    arrived: bool,
}

#[derive(Default)]
struct Inner {
    /// Arrivals per gate name, for key numbering
    arrivals: HashMap<String, u32>,
    /// Keyed `name/occurrence`
    slots: HashMap<String, Slot>,
}

/// Shared handle signalling gates from outside the engine
#[derive(Clone)]
pub struct GateController {
    inner: Arc<Mutex<Inner>>,
    /// Version counter bumped on every state change; waiters watch it
    changed: watch::Sender<u64>,
}

impl Default for GateController {
    fn default() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changed,
        }
    }
}

impl GateController {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Called by the gate step runner: register this arrival and obtain the
    /// channel its signal will come in on. Returns the numbered key.
    pub fn arrive(&self, name: &str) -> (String, oneshot::Receiver<StepOutcome>) {
        let (tx, rx) = oneshot::channel();
        let key = {
            let mut inner = self.inner.lock().expect("gate lock poisoned");
            let count = inner.arrivals.entry(name.to_string()).or_insert(0);
            *count += 1;
            let key = format!("{}/{}", name, count);
            let slot = inner.slots.entry(key.clone()).or_default();
            slot.arrived = true;
            if let Some(outcome) = slot.outcome.take() {
                // Signalled before the step got here
                let _ = tx.send(outcome);
            } else {
                slot.waiter = Some(tx);
            }
            key
        };
        self.bump();
        (key, rx)
    }

    /// Release a gate successfully
    pub fn release(&self, key: &str, value: serde_json::Value) {
        self.signal(key, StepOutcome::Success(value));
    }

    /// Fail a gate with a step failure
    pub fn fail(&self, key: &str, failure: StepFailure) {
        self.signal(key, StepOutcome::Failure(failure));
    }

    fn signal(&self, key: &str, outcome: StepOutcome) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        let slot = inner.slots.entry(key.to_string()).or_default();
        if let Some(waiter) = slot.waiter.take() {
            let _ = waiter.send(outcome);
        } else {
            slot.outcome = Some(outcome);
        }
        drop(inner);
        self.bump();
    }

    /// Whether a gate step has arrived at the given key
    pub fn has_arrived(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("gate lock poisoned");
        inner.slots.get(key).map(|s| s.arrived).unwrap_or(false)
    }

    /// Wait until a gate step arrives at the given key
    pub async fn wait_for_arrival(&self, key: &str) {
        let mut rx = self.changed.subscribe();
        loop {
            if self.has_arrived(key) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for GateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("gate lock poisoned");
        f.debug_struct("GateController")
            .field("slots", &inner.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
