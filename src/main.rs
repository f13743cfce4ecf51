use anyhow::{Context, Result};
use flowline::cli::commands::{HistoryCommand, ResumeCommand, RunCommand, ValidateCommand};
use flowline::cli::output::*;
use flowline::cli::{Cli, Command};
use flowline::persistence::{CheckpointStore, InMemoryCheckpointStore, StoreOwner};
use flowline::{FlowConfig, FlowExecution, FlowOutcome, ScriptConfig};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_script(cmd).await?,
        Command::Resume(cmd) => resume_execution(cmd).await?,
        Command::Validate(cmd) => validate_script(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

async fn open_store(ephemeral: bool) -> Result<Arc<dyn CheckpointStore>> {
    if ephemeral {
        return Ok(Arc::new(InMemoryCheckpointStore::new()));
    }
    #[cfg(feature = "sqlite")]
    {
        let store = flowline::persistence::SqliteCheckpointStore::with_default_path()
            .await
            .context("Failed to open checkpoint store")?;
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "sqlite"))]
    Ok(Arc::new(InMemoryCheckpointStore::new()))
}

async fn run_script(cmd: &RunCommand) -> Result<()> {
    let config = ScriptConfig::from_file(&cmd.file).context("Failed to load script")?;
    let script = config.to_script();

    println!("{} Loaded script: {}", INFO, style(&script.name).bold());

    let store = open_store(cmd.ephemeral).await?;
    let owner = Arc::new(StoreOwner::new(Uuid::new_v4(), store));
    let (flow_config, _gates) = FlowConfig::standard();
    let execution = FlowExecution::new(script, owner, flow_config);

    execution.add_event_handler(|event| {
        println!("{}", format_flow_event(&event));
    });

    println!();
    execution.start().await.context("Failed to start execution")?;
    let outcome = execution.wait_terminal().await;

    finish(cmd.ephemeral, execution.execution_id(), outcome)
}

async fn resume_execution(cmd: &ResumeCommand) -> Result<()> {
    let id = Uuid::parse_str(&cmd.id).context("Invalid execution id")?;
    let store = open_store(false).await?;
    let owner = Arc::new(StoreOwner::new(id, store));
    let (flow_config, _gates) = FlowConfig::standard();

    let execution = FlowExecution::load(owner, flow_config)
        .await
        .context("Failed to load checkpoint")?;

    execution.add_event_handler(|event| {
        println!("{}", format_flow_event(&event));
    });

    println!(
        "{} Resuming execution {} ({})",
        INFO,
        style(&cmd.id[..8]).dim(),
        format_status(execution.status().await)
    );
    execution.resume().await.context("Failed to resume")?;
    let outcome = execution.wait_terminal().await;

    finish(false, id, outcome)
}

fn finish(ephemeral: bool, id: Uuid, outcome: Option<FlowOutcome>) -> Result<()> {
    if !ephemeral {
        println!(
            "\n{} Checkpoint saved (ID: {})",
            INFO,
            style(&id.to_string()[..8]).dim()
        );
    }
    match outcome {
        Some(FlowOutcome::Success) => Ok(()),
        Some(other) => {
            println!("{}", format_outcome(&other));
            std::process::exit(1);
        }
        None => anyhow::bail!("execution ended without an outcome"),
    }
}

fn validate_script(cmd: &ValidateCommand) -> Result<()> {
    match ScriptConfig::from_file(&cmd.file) {
        Ok(config) => {
            let script = config.to_script();
            println!(
                "{} {} is valid ({} steps)",
                CHECK,
                style(&cmd.file).bold(),
                script.step_count()
            );
            Ok(())
        }
        Err(err) => {
            println!("{} {} is invalid: {}", CROSS, style(&cmd.file).bold(), err);
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_store(false).await?;
    let summaries = store.list().await.context("Failed to list checkpoints")?;

    if summaries.is_empty() {
        println!("{} No checkpointed executions", INFO);
        return Ok(());
    }
    for summary in summaries.iter().take(cmd.limit) {
        println!("{}", format_summary(summary));
    }
    Ok(())
}
