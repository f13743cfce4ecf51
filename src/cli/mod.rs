//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, ResumeCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// Checkpointable pipeline execution engine
#[derive(Debug, Parser, Clone)]
#[command(name = "flowline")]
#[command(author = "Flowline Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run declarative pipeline scripts as resumable executions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a script as a new execution
    Run(RunCommand),

    /// Resume an execution from its checkpoint
    Resume(ResumeCommand),

    /// Validate a script configuration
    Validate(ValidateCommand),

    /// Show checkpointed executions
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
