//! Compiled script model - the statement tree the engine interprets

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A call to a leaf step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCall {
    /// Step function name (e.g. "echo", "gate", "sleep", or a custom runner's name)
    pub name: String,

    /// Step arguments, passed through to the runner
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,
}

impl StepCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Get a string argument
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }

    /// Get an integer argument
    pub fn int_arg(&self, key: &str) -> Option<i64> {
        self.args.get(key).and_then(|v| v.as_i64())
    }
}

/// One statement in a script body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statement {
    /// Run a leaf step
    Step(StepCall),

    /// Run the body, re-entering it on failure up to `attempts` total attempts
    Retry { attempts: u32, body: Vec<Statement> },

    /// Run every branch concurrently; fan-in at the end
    Parallel {
        branches: Vec<ParallelBranch>,
        #[serde(default)]
        fail_fast: bool,
    },

    /// Acquire a named resource, run the body, release on every exit path
    Resource { resource: String, body: Vec<Statement> },
}

/// A named branch of a parallel block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub name: String,
    pub body: Vec<Statement>,
}

/// A compiled script: what a `FlowExecution` runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// Script name (for history and diagnostics)
    pub name: String,

    /// Top-level statement sequence
    pub statements: Vec<Statement>,

    /// Whether the script runs in restricted mode (opaque to the engine)
    #[serde(default)]
    pub sandbox: bool,
}

impl Script {
    pub fn new(name: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            statements,
            sandbox: false,
        }
    }

    /// Count leaf steps, descending into blocks
    pub fn step_count(&self) -> usize {
        fn count(stmts: &[Statement]) -> usize {
            stmts
                .iter()
                .map(|s| match s {
                    Statement::Step(_) => 1,
                    Statement::Retry { body, .. } | Statement::Resource { body, .. } => count(body),
                    Statement::Parallel { branches, .. } => {
                        branches.iter().map(|b| count(&b.body)).sum()
                    }
                })
                .sum()
        }
        count(&self.statements)
    }
}
