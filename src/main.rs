use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowmill_core::config::EngineConfig;
use flowmill_core::definition::ProcessDefinition;
use flowmill_core::traits::DefinitionStore;
use flowmill_core::types::{InstanceStatus, Principal, Variables};
use flowmill_engine::engine::StartRequest;
use flowmill_engine::{Engine, TracingNotifier};
use flowmill_store::{SqliteStore, StaticGroupDirectory};

#[derive(Parser)]
#[command(name = "flowmill", version, about = "Embeddable BPMN-style workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowmill.toml")]
    config: PathBuf,

    /// Acting user for task and instance commands
    #[arg(short, long, env = "FLOWMILL_USER", default_value = "admin")]
    user: String,

    /// Groups of the acting user (defaults to the configured directory)
    #[arg(short, long, value_delimiter = ',')]
    groups: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a process definition from a JSON file
    Deploy {
        file: PathBuf,
        /// Mark the stored version as published
        #[arg(long)]
        publish: bool,
    },
    /// Start an instance of a published definition
    Start {
        definition_id: String,
        /// Initial variables as a JSON object
        #[arg(long, default_value = "{}")]
        vars: String,
        #[arg(long)]
        business_key: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
    },
    /// List open tasks the user may act on, or every task of an instance
    Tasks {
        #[arg(long)]
        instance: Option<String>,
    },
    /// Claim a pending task
    Claim { task_id: String },
    /// Release a claimed task
    Unclaim { task_id: String },
    /// Complete a task, merging variables into the instance
    Complete {
        task_id: String,
        /// Completion variables as a JSON object
        #[arg(long, default_value = "{}")]
        vars: String,
    },
    /// Assign a task to an eligible user
    Assign { task_id: String, assignee: String },
    /// Hand a task to another user, keeping the current owner
    Delegate {
        task_id: String,
        to: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Move a task and its ownership to another user
    Transfer {
        task_id: String,
        to: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Reassign a task to another eligible user
    Reassign {
        task_id: String,
        to: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Cancel an open task
    Cancel {
        task_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show an instance, or list instances
    Status {
        instance_id: Option<String>,
        /// Filter the listing by status (RUNNING, ERROR, ...)
        #[arg(long)]
        status: Option<String>,
    },
    /// Suspend a running instance
    Suspend { instance_id: String },
    /// Resume a suspended instance
    Resume { instance_id: String },
    /// Re-run the failed node of an instance in ERROR
    Retry { instance_id: String },
    /// Terminate an instance and cancel its open tasks
    Terminate {
        instance_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Flag open tasks past their due date
    Overdue,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowmill=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowmill", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.store_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let directory = StaticGroupDirectory::from_config(&config);
    let principal = principal(&cli, &directory);

    if let Commands::Deploy { file, publish } = &cli.command {
        return deploy(store.as_ref(), file, *publish).await;
    }

    let engine = Engine::builder(config)
        .store(store)
        .directory(Arc::new(directory))
        .notifier(Arc::new(TracingNotifier))
        .build()?;

    let result = run(&engine, cli.command, &principal).await;
    engine.shutdown().await;
    if let Err(e) = &result {
        if let Some(flow) = e.downcast_ref::<flowmill_core::FlowError>() {
            eprintln!("error [{}]: {}", flow.kind(), flow);
            std::process::exit(1);
        }
    }
    result
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        return Ok(EngineConfig::load(path)?);
    }
    let home_config = std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".flowmill").join("config.toml"));
    match home_config {
        Some(home) if home.exists() => {
            info!(path = %home.display(), "Loading config from home directory");
            Ok(EngineConfig::load(&home)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

fn principal(cli: &Cli, directory: &StaticGroupDirectory) -> Principal {
    let groups = if cli.groups.is_empty() {
        directory.groups_of(&cli.user)
    } else {
        cli.groups.clone()
    };
    Principal::new(&cli.user).with_groups(groups)
}

fn parse_vars(raw: &str) -> anyhow::Result<Variables> {
    match serde_json::from_str(raw).context("variables must be JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("variables must be a JSON object, got {}", other),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn deploy(store: &SqliteStore, file: &Path, publish: bool) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let mut definition: ProcessDefinition = serde_json::from_str(&content)?;
    if publish {
        definition = definition.published();
    }
    definition.graph.validate()?;
    store.save_definition(&definition).await?;
    info!(
        definition_id = %definition.id,
        version = definition.version,
        status = definition.status.as_str(),
        "Definition deployed"
    );
    println!(
        "{} v{} ({})",
        definition.id,
        definition.version,
        definition.status.as_str()
    );
    Ok(())
}

async fn run(engine: &Engine, command: Commands, principal: &Principal) -> anyhow::Result<()> {
    match command {
        Commands::Start {
            definition_id,
            vars,
            business_key,
            priority,
        } => {
            let mut request =
                StartRequest::new(definition_id, &principal.id).variables(parse_vars(&vars)?);
            if let Some(key) = business_key {
                request = request.business_key(key);
            }
            if let Some(priority) = priority {
                request = request.priority(priority);
            }
            let started = engine.start_instance(request).await?;
            engine.wait_idle().await;
            print_json(&engine.get_instance(&started.id).await?)?;
        }
        Commands::Tasks { instance } => {
            let tasks = match instance {
                Some(id) => engine.tasks_for_instance(&id).await?,
                None => engine.open_tasks_for(principal).await?,
            };
            print_json(&tasks)?;
        }
        Commands::Claim { task_id } => {
            print_json(&engine.claim_task(&task_id, principal).await?)?;
        }
        Commands::Unclaim { task_id } => {
            print_json(&engine.unclaim_task(&task_id, principal).await?)?;
        }
        Commands::Complete { task_id, vars } => {
            let task = engine
                .complete_task(&task_id, principal, parse_vars(&vars)?)
                .await?;
            engine.wait_idle().await;
            print_json(&engine.get_instance(&task.instance_id).await?)?;
        }
        Commands::Assign { task_id, assignee } => {
            print_json(&engine.assign_task(&task_id, principal, &assignee).await?)?;
        }
        Commands::Delegate { task_id, to, reason } => {
            let task = engine
                .delegate_task(&task_id, principal, &to, reason.as_deref())
                .await?;
            print_json(&task)?;
        }
        Commands::Transfer { task_id, to, reason } => {
            let task = engine
                .transfer_task(&task_id, principal, &to, reason.as_deref())
                .await?;
            print_json(&task)?;
        }
        Commands::Reassign { task_id, to, reason } => {
            let task = engine
                .reassign_task(&task_id, principal, &to, reason.as_deref())
                .await?;
            print_json(&task)?;
        }
        Commands::Cancel { task_id, reason } => {
            print_json(&engine.cancel_task(&task_id, principal, reason.as_deref()).await?)?;
        }
        Commands::Status {
            instance_id: Some(id),
            ..
        } => {
            print_json(&engine.get_instance(&id).await?)?;
        }
        Commands::Status {
            instance_id: None,
            status,
        } => {
            let filter = match status {
                Some(s) => Some(
                    InstanceStatus::parse(&s.to_ascii_uppercase())
                        .with_context(|| format!("unknown status '{}'", s))?,
                ),
                None => None,
            };
            print_json(&engine.list_instances(filter).await?)?;
        }
        Commands::Suspend { instance_id } => {
            print_json(&engine.suspend_instance(&instance_id).await?)?;
        }
        Commands::Resume { instance_id } => {
            engine.resume_instance(&instance_id).await?;
            engine.wait_idle().await;
            print_json(&engine.get_instance(&instance_id).await?)?;
        }
        Commands::Retry { instance_id } => {
            engine.retry_instance(&instance_id).await?;
            engine.wait_idle().await;
            print_json(&engine.get_instance(&instance_id).await?)?;
        }
        Commands::Terminate {
            instance_id,
            reason,
        } => {
            let instance = engine
                .terminate_instance(&instance_id, reason.as_deref())
                .await?;
            print_json(&instance)?;
        }
        Commands::Overdue => {
            let flagged = engine.overdue_monitor().scan_once().await?;
            println!("{} task(s) flagged overdue", flagged);
        }
        Commands::Deploy { .. } | Commands::Config | Commands::Completions { .. } => {}
    }
    Ok(())
}
