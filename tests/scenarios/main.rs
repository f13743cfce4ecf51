//! Scenario-based tests for the flowline engine

#[path = "../helpers.rs"]
mod helpers;

mod current_executions;
mod parallel_blocks;
mod pause_resume;
mod rehydration;
mod resource_scope;
