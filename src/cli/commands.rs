//! CLI command definitions

use clap::Args;

/// Run a script as a new execution
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to script YAML file
    #[arg(short, long)]
    pub file: String,

    /// Keep checkpoints in memory instead of the on-disk store
    #[arg(long)]
    pub ephemeral: bool,
}

/// Resume an execution from its checkpoint
#[derive(Debug, Args, Clone)]
pub struct ResumeCommand {
    /// Execution id to resume
    #[arg(long)]
    pub id: String,
}

/// Validate a script configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to script YAML file
    #[arg(short, long)]
    pub file: String,
}

/// Show checkpointed executions
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,
}
