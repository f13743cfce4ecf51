//! flowline - a checkpointable pipeline execution engine
//!
//! A compiled script (a tree of leaf steps and retry/parallel/resource
//! blocks) runs as a long-lived, resumable execution: the engine records
//! every step and block boundary in an append-only flow node graph, tracks
//! one active head per live branch, checkpoints after every graph mutation,
//! and reconstructs non-serializable live references through the pickle
//! registry when an execution is resumed after a restart.

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod pickle;

// Re-export commonly used types
pub use crate::core::config::ScriptConfig;
pub use crate::core::graph::{BlockKind, FlowGraph, FlowNode, NodeId, NodeKind};
pub use crate::core::script::{ParallelBranch, Script, Statement, StepCall};
pub use crate::core::state::{ExecutionStatus, FlowOutcome, StepFailure, StepOutcome};
pub use execution::{
    EngineError, EngineFault, ExecutionRegistry, FlowConfig, FlowEvent, FlowExecution,
    GateController, StepHandle, StepRunner,
};
pub use persistence::{
    CheckpointStore, ExecutionOwner, ExecutionSnapshot, ExecutionSummary, InMemoryCheckpointStore,
    PersistError, StoreOwner,
};
pub use pickle::{LiveObject, PickleDescriptor, PickleFactory, PickleRegistry};
