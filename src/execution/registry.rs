//! In-memory execution registry
//!
//! Exactly one `FlowExecution` instance may be live per identity; loading a
//! checkpoint through the registry never creates a duplicate for an
//! execution that is already in memory.

use crate::execution::engine::{EngineError, FlowConfig, FlowExecution};
use crate::persistence::ExecutionOwner;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
pub struct ExecutionRegistry {
    executions: Mutex<HashMap<Uuid, Arc<FlowExecution>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created execution
    pub fn register(&self, execution: Arc<FlowExecution>) -> Result<(), EngineError> {
        let mut executions = self.executions.lock().expect("registry lock poisoned");
        let id = execution.execution_id();
        if executions.contains_key(&id) {
            return Err(EngineError::AlreadyLoaded(id));
        }
        executions.insert(id, execution);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<FlowExecution>> {
        let executions = self.executions.lock().expect("registry lock poisoned");
        executions.get(&id).cloned()
    }

    /// The live instance for the owner's identity, loading the checkpoint
    /// only if none exists yet
    pub async fn get_or_load(
        &self,
        owner: Arc<dyn ExecutionOwner>,
        config: FlowConfig,
    ) -> Result<Arc<FlowExecution>, EngineError> {
        let id = owner.execution_id();
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }
        let loaded = FlowExecution::load(owner, config).await?;
        let mut executions = self.executions.lock().expect("registry lock poisoned");
        // A concurrent load may have won the race
        if let Some(existing) = executions.get(&id) {
            return Ok(Arc::clone(existing));
        }
        executions.insert(id, Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Drop a terminal execution from the registry
    pub fn remove(&self, id: Uuid) -> Option<Arc<FlowExecution>> {
        let mut executions = self.executions.lock().expect("registry lock poisoned");
        executions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.executions.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
