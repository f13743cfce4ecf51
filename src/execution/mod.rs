//! Continuation-based execution engine

pub mod branch;
pub mod engine;
pub mod gate;
pub mod registry;
pub mod resource;
pub mod runner;

pub use engine::{
    EngineError, EngineFault, EventHandler, FlowConfig, FlowEvent, FlowExecution, StepHandle,
};
pub use gate::GateController;
pub use registry::ExecutionRegistry;
pub use resource::{
    LeaseHandle, LeasePickleFactory, LocalResourceProvider, ResourceProvider, LOCAL_LEASE_TAG,
};
pub use runner::{BuiltinRunner, CancelSignal, StepContext, StepRunner};
