//! Script configuration from YAML

use crate::core::script::{ParallelBranch, Script, Statement, StepCall};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level script configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Script name
    pub name: String,

    /// Script version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Whether the script runs in restricted mode
    #[serde(default)]
    pub sandbox: bool,

    /// Top-level statements
    pub statements: Vec<StatementConfig>,
}

/// One statement as defined in YAML
///
/// A mapping with a `step` key is a leaf step; `retry`, `parallel` and
/// `resource` keys introduce blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatementConfig {
    Step {
        step: String,
        #[serde(default)]
        args: BTreeMap<String, serde_json::Value>,
    },
    Retry {
        retry: RetryConfig,
    },
    Parallel {
        parallel: ParallelConfig,
    },
    Resource {
        resource: ResourceConfig,
    },
}

/// Retry block configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    pub body: Vec<StatementConfig>,
}

/// Parallel block configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub branches: Vec<BranchConfig>,

    /// Abort the other branches on the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

/// One branch of a parallel block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    pub body: Vec<StatementConfig>,
}

/// Resource block configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub body: Vec<StatementConfig>,
}

impl ScriptConfig {
    /// Load script configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse script configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ScriptConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the script configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Script name must not be empty");
        }
        validate_statements(&self.statements)?;
        Ok(())
    }

    /// Convert the configuration into the compiled script the engine runs
    pub fn to_script(&self) -> Script {
        Script {
            name: self.name.clone(),
            statements: self.statements.iter().map(convert_statement).collect(),
            sandbox: self.sandbox,
        }
    }
}

fn validate_statements(statements: &[StatementConfig]) -> Result<()> {
    for statement in statements {
        match statement {
            StatementConfig::Step { step, .. } => {
                if step.trim().is_empty() {
                    anyhow::bail!("Step name must not be empty");
                }
            }
            StatementConfig::Retry { retry } => {
                if retry.attempts == 0 {
                    anyhow::bail!("Retry block must allow at least one attempt");
                }
                validate_statements(&retry.body)?;
            }
            StatementConfig::Parallel { parallel } => {
                if parallel.branches.is_empty() {
                    anyhow::bail!("Parallel block must have at least one branch");
                }
                let mut seen = std::collections::HashSet::new();
                for branch in &parallel.branches {
                    if !seen.insert(&branch.name) {
                        anyhow::bail!("Duplicate parallel branch name: {}", branch.name);
                    }
                    validate_statements(&branch.body)?;
                }
            }
            StatementConfig::Resource { resource } => {
                if resource.name.trim().is_empty() {
                    anyhow::bail!("Resource block must name a resource");
                }
                validate_statements(&resource.body)?;
            }
        }
    }
    Ok(())
}

fn convert_statement(statement: &StatementConfig) -> Statement {
    match statement {
        StatementConfig::Step { step, args } => Statement::Step(StepCall {
            name: step.clone(),
            args: args.clone(),
        }),
        StatementConfig::Retry { retry } => Statement::Retry {
            attempts: retry.attempts,
            body: retry.body.iter().map(convert_statement).collect(),
        },
        StatementConfig::Parallel { parallel } => Statement::Parallel {
            branches: parallel
                .branches
                .iter()
                .map(|b| ParallelBranch {
                    name: b.name.clone(),
                    body: b.body.iter().map(convert_statement).collect(),
                })
                .collect(),
            fail_fast: parallel.fail_fast,
        },
        StatementConfig::Resource { resource } => Statement::Resource {
            resource: resource.name.clone(),
            body: resource.body.iter().map(convert_statement).collect(),
        },
    }
}
