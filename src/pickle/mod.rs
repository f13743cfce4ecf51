//! Pickles - serializable stand-ins for live objects across checkpoints
//!
//! A live reference held by a branch (an open resource handle, a remote
//! future) cannot be written into a checkpoint directly. At snapshot time it
//! is replaced by a descriptor produced by a registered `PickleFactory`; on
//! resume the factory asynchronously rebuilds the live object from the
//! descriptor while the owning branch stays blocked.

use crate::persistence::ExecutionOwner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A live, non-serializable object carried in a branch's bindings
pub trait LiveObject: Any + Send + Sync + std::fmt::Debug {
    /// Tag matching the factory registered for this object type
    fn tag(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Serializable stand-in for one live object
///
/// Created at checkpoint time, consumed and discarded once rehydration
/// succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickleDescriptor {
    /// Factory tag this descriptor belongs to
    pub tag: String,

    /// Whatever the factory needs to re-obtain the object
    pub data: serde_json::Value,
}

impl PickleDescriptor {
    pub fn new(tag: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            tag: tag.into(),
            data,
        }
    }
}

/// Capability registered per live-object tag
///
/// `rehydrate` returning `None` means "not recoverable yet"; the engine keeps
/// retrying on an interval, surfacing `waiting_message` each attempt, until
/// the object comes back or the execution is interrupted.
#[async_trait]
pub trait PickleFactory: Send + Sync {
    fn pickle(&self, live: &Arc<dyn LiveObject>) -> Option<PickleDescriptor>;

    async fn rehydrate(
        &self,
        descriptor: &PickleDescriptor,
        owner: &dyn ExecutionOwner,
    ) -> Option<Arc<dyn LiveObject>>;

    /// Human-readable diagnostic shown while rehydration keeps yielding nothing
    fn waiting_message(&self, descriptor: &PickleDescriptor) -> String {
        format!("Still waiting to restore `{}`", descriptor.tag)
    }
}

/// Capability table: tag → factory, resolved at engine construction
#[derive(Default)]
pub struct PickleRegistry {
    factories: HashMap<String, Arc<dyn PickleFactory>>,
}

impl PickleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl Into<String>, factory: Arc<dyn PickleFactory>) {
        self.factories.insert(tag.into(), factory);
    }

    /// Whether a factory is registered for the given tag
    pub fn can_pickle(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn factory(&self, tag: &str) -> Option<Arc<dyn PickleFactory>> {
        self.factories.get(tag).cloned()
    }

    /// Produce a descriptor for a live object, or report why it cannot be done
    pub fn pickle(&self, live: &Arc<dyn LiveObject>) -> Result<PickleDescriptor, PickleError> {
        let tag = live.tag().to_string();
        let factory = self
            .factories
            .get(&tag)
            .ok_or_else(|| PickleError::Unsupported { tag: tag.clone() })?;
        factory
            .pickle(live)
            .ok_or(PickleError::Refused { tag })
    }
}

impl std::fmt::Debug for PickleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickleRegistry")
            .field("tags", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Failure to turn a live object into a descriptor
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PickleError {
    #[error("no pickle factory registered for `{tag}`")]
    Unsupported { tag: String },

    #[error("pickle factory for `{tag}` refused the object")]
    Refused { tag: String },
}
