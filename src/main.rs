use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use accu_config::EngineConfig;
use accu_orchestrator::Orchestrator;
use accu_runtime::{InstanceStatus, ListFilter, Runtime, WorkflowKind};
use accu_store::SqliteStore;

/// Accu - durable deadline and approval workflows for carbon-credit projects
#[derive(Parser)]
#[command(name = "accu")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.accu)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to an engine configuration file (JSON)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Recover instances and drive their timers until Ctrl-C
  Run,

  /// Start a workflow for an entity
  Trigger {
    entity_type: String,
    entity_id: String,
    /// application_lifecycle, project_lifecycle or deadlines
    trigger_type: String,
    /// Start input as JSON
    #[arg(long)]
    input: Option<String>,
    #[arg(long, default_value = "cli")]
    performed_by: String,
  },

  /// Send a signal and wait for it to be applied
  Signal {
    workflow_id: String,
    name: String,
    /// Signal payload as JSON
    #[arg(long)]
    payload: Option<String>,
  },

  /// Run a query against the last committed state
  Query {
    workflow_id: String,
    name: String,
    /// Query arguments as JSON
    #[arg(long)]
    args: Option<String>,
  },

  /// List workflow instances
  List {
    /// Workflow type (deadline, application_lifecycle, project_lifecycle)
    #[arg(long = "type")]
    workflow_type: Option<String>,
    /// Instance status (active, paused, completed, cancelled, failed)
    #[arg(long)]
    status: Option<String>,
  },

  /// Force an instance to cancelled
  Terminate {
    workflow_id: String,
    #[arg(long)]
    reason: String,
    #[arg(long, default_value = "cli")]
    performed_by: String,
  },

  /// Remove finished instances older than the retention period
  Gc,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();

  let Some(command) = cli.command else {
    println!("accu - use --help to see available commands");
    return Ok(());
  };

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".accu"),
  };
  let config = match &cli.config {
    Some(path) => EngineConfig::from_file(path)?,
    None => EngineConfig::default(),
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { execute(command, &data_dir, config).await })
}

async fn execute(command: Commands, data_dir: &Path, config: EngineConfig) -> Result<()> {
  let orchestrator = open(data_dir, config).await?;
  let runtime = orchestrator.runtime();

  match command {
    Commands::Run => {
      let cancel = CancellationToken::new();
      let driver = {
        let runtime = runtime.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runtime.run(cancel).await })
      };

      tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
      cancel.cancel();
      driver.await.context("timer driver panicked")?;
      runtime.shutdown();
    }
    Commands::Trigger {
      entity_type,
      entity_id,
      trigger_type,
      input,
      performed_by,
    } => {
      let input = parse_json(input.as_deref(), "--input")?;
      let id = orchestrator
        .trigger_workflow(&entity_type, &entity_id, &trigger_type, input, &performed_by)
        .await?;
      println!("{}", id);
    }
    Commands::Signal {
      workflow_id,
      name,
      payload,
    } => {
      let payload = parse_json(payload.as_deref(), "--payload")?;
      orchestrator
        .signal_workflow(&workflow_id, &name, payload)
        .await?;
      print_json(&orchestrator.query_workflow(&workflow_id, "getWorkflowStatus", &serde_json::Value::Null)?)?;
    }
    Commands::Query {
      workflow_id,
      name,
      args,
    } => {
      let args = parse_json(args.as_deref(), "--args")?;
      print_json(&orchestrator.query_workflow(&workflow_id, &name, &args)?)?;
    }
    Commands::List {
      workflow_type,
      status,
    } => {
      let filter = ListFilter {
        workflow_type: workflow_type
          .map(|t| t.parse::<WorkflowKind>())
          .transpose()
          .map_err(anyhow::Error::msg)?,
        status: status
          .map(|s| s.parse::<InstanceStatus>())
          .transpose()
          .map_err(anyhow::Error::msg)?,
        ..ListFilter::default()
      };
      print_json(&serde_json::to_value(orchestrator.list_workflows(&filter))?)?;
    }
    Commands::Terminate {
      workflow_id,
      reason,
      performed_by,
    } => {
      orchestrator
        .terminate_workflow(&workflow_id, &reason, &performed_by)
        .await?;
      println!("terminated {}", workflow_id);
    }
    Commands::Gc => {
      let removed = runtime.collect_garbage().await?;
      println!("removed {} instance(s)", removed.len());
    }
  }

  Ok(())
}

/// Open the SQLite store under `data_dir` and recover every instance.
async fn open(data_dir: &Path, config: EngineConfig) -> Result<Orchestrator> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let db_path = data_dir.join("accu.db");
  let store = SqliteStore::open(&db_path)
    .await
    .with_context(|| format!("failed to open store: {}", db_path.display()))?;

  let runtime = accu_workflows::register_all(Runtime::builder(config))
    .store(Arc::new(store))
    .build();
  let report = runtime
    .recover()
    .await
    .context("failed to recover workflow instances")?;
  info!(
    restored = report.restored,
    resumed = report.resumed,
    data_dir = %data_dir.display(),
    "store_opened"
  );

  Ok(Orchestrator::new(runtime))
}

fn parse_json(raw: Option<&str>, flag: &str) -> Result<serde_json::Value> {
  match raw {
    Some(text) if !text.trim().is_empty() => {
      serde_json::from_str(text).with_context(|| format!("failed to parse {} as JSON", flag))
    }
    _ => Ok(serde_json::Value::Null),
  }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
