//! Scoped resource acquisition
//!
//! A `resource` block acquires a named external resource before its body runs
//! and guarantees release on every exit path, including failure and abort.
//! The handle is a live object: it survives checkpoints as a pickle and is
//! re-acquired on resume.

use crate::core::state::StepFailure;
use crate::execution::runner::CancelSignal;
use crate::persistence::ExecutionOwner;
use crate::pickle::{LiveObject, PickleDescriptor, PickleFactory};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Acquires and releases the external resources named by `resource` blocks
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn acquire(
        &self,
        resource: &str,
        cancel: CancelSignal,
    ) -> Result<Arc<dyn LiveObject>, StepFailure>;

    async fn release(&self, handle: Arc<dyn LiveObject>);
}

/// Pickle tag for handles issued by [`LocalResourceProvider`]
pub const LOCAL_LEASE_TAG: &str = "local-lease";

/// An in-process lease on a named resource
#[derive(Debug)]
pub struct LeaseHandle {
    pub resource: String,
    pub lease: u32,
}

impl LiveObject for LeaseHandle {
    fn tag(&self) -> &str {
        LOCAL_LEASE_TAG
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Default provider: hands out counted in-process leases
///
/// Acquisition never blocks; the value of the provider is the scoped
/// release contract and the rehydration path, not contention management.
#[derive(Default)]
pub struct LocalResourceProvider {
    leases: Mutex<HashMap<String, u32>>,
}

impl LocalResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases currently held on a resource
    pub fn held(&self, resource: &str) -> u32 {
        let leases = self.leases.lock().expect("lease lock poisoned");
        leases.get(resource).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceProvider for LocalResourceProvider {
    async fn acquire(
        &self,
        resource: &str,
        _cancel: CancelSignal,
    ) -> Result<Arc<dyn LiveObject>, StepFailure> {
        let lease = {
            let mut leases = self.leases.lock().expect("lease lock poisoned");
            let count = leases.entry(resource.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        debug!(resource, lease, "lease acquired");
        Ok(Arc::new(LeaseHandle {
            resource: resource.to_string(),
            lease,
        }))
    }

    async fn release(&self, handle: Arc<dyn LiveObject>) {
        if let Some(lease) = handle.as_any().downcast_ref::<LeaseHandle>() {
            let mut leases = self.leases.lock().expect("lease lock poisoned");
            if let Some(count) = leases.get_mut(&lease.resource) {
                *count = count.saturating_sub(1);
            }
            debug!(resource = %lease.resource, "lease released");
        }
    }
}

/// Pickles [`LeaseHandle`]s; rehydration re-acquires from the provider
pub struct LeasePickleFactory {
    provider: Arc<LocalResourceProvider>,
}

impl LeasePickleFactory {
    pub fn new(provider: Arc<LocalResourceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl PickleFactory for LeasePickleFactory {
    fn pickle(&self, live: &Arc<dyn LiveObject>) -> Option<PickleDescriptor> {
        let lease = live.as_any().downcast_ref::<LeaseHandle>()?;
        Some(PickleDescriptor::new(
            LOCAL_LEASE_TAG,
            serde_json::json!({ "resource": lease.resource }),
        ))
    }

    async fn rehydrate(
        &self,
        descriptor: &PickleDescriptor,
        _owner: &dyn ExecutionOwner,
    ) -> Option<Arc<dyn LiveObject>> {
        let resource = descriptor.data.get("resource")?.as_str()?;
        self.provider
            .acquire(resource, CancelSignal::never())
            .await
            .ok()
    }

    fn waiting_message(&self, descriptor: &PickleDescriptor) -> String {
        let resource = descriptor
            .data
            .get("resource")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        format!("Still waiting to re-acquire resource `{}`", resource)
    }
}
