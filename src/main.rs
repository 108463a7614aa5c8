use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use action_scheduler::config::{ConsulConfig, SchedulerConfig};
use action_scheduler::dashboard::{run_dashboard, DashboardState};
use action_scheduler::scheduler::{
    register_action, unregister_action, ActionDefinition, ActionDispatcher, LogActionHandler,
    Scheduler, TaskRecordHandler,
};
use action_scheduler::shutdown::stop_on_signal;
use action_scheduler::store::{ConsulStore, CoordinationStore, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "action-scheduler")]
#[command(version)]
#[command(about = "A leader-elected scheduler of periodic actions backed by Consul")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a scheduler instance
    Server(ServerArgs),

    /// Scheduled action management commands
    Action {
        #[command(flatten)]
        consul: ConsulArgs,

        #[command(flatten)]
        prefixes: PrefixArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: ActionCommands,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ConsulArgs {
    /// Consul agent HTTP address
    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = "http://127.0.0.1:8500")]
    consul_addr: String,

    /// Consul ACL token
    #[arg(long, env = "CONSUL_HTTP_TOKEN")]
    consul_token: Option<String>,

    /// Consul datacenter (defaults to the agent's own)
    #[arg(long, env = "CONSUL_DATACENTER")]
    consul_datacenter: Option<String>,
}

impl ConsulArgs {
    fn to_config(&self) -> ConsulConfig {
        ConsulConfig {
            address: self.consul_addr.clone(),
            token: self.consul_token.clone(),
            datacenter: self.consul_datacenter.clone(),
        }
    }
}

#[derive(Parser, Debug)]
struct PrefixArgs {
    /// Root of the scheduling keyspace
    #[arg(long, env = "SCHEDULER_PREFIX", default_value = "_yorc/scheduling")]
    scheduling_prefix: String,

    /// Root of the service keyspace holding the leader lock
    #[arg(long, env = "SCHEDULER_SERVICE_PREFIX", default_value = "_yorc/service")]
    service_prefix: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    #[command(flatten)]
    consul: ConsulArgs,

    #[command(flatten)]
    prefixes: PrefixArgs,

    /// Keep all state in process memory instead of Consul (single node only)
    #[arg(long)]
    in_memory: bool,

    /// Port for the status API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Action types turned into task records (comma-separated)
    #[arg(long, default_value = "")]
    task_types: String,

    /// Action types that are only logged (comma-separated)
    #[arg(long, default_value = "")]
    log_types: String,

    /// Maximum wait of a blocking list query, in seconds
    #[arg(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    watch_wait_secs: u64,

    /// Leader session TTL, in seconds (Consul accepts 10 to 86400)
    #[arg(long, default_value = "15", value_parser = clap::value_parser!(u64).range(1..=86400))]
    session_ttl_secs: u64,

    /// Grace period for in-flight dispatches when an action stops, in seconds
    #[arg(long, default_value = "10")]
    stop_grace_secs: u64,
}

// =============================================================================
// Action Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ActionCommands {
    /// Register a new scheduled action
    Register {
        /// Action type tag
        #[arg(long = "type")]
        action_type: String,

        /// Interval between two dispatches (e.g., "30s", "1m30s")
        #[arg(long)]
        interval: String,

        /// Deployment the action belongs to
        #[arg(long, default_value = "")]
        deployment_id: String,

        /// Action id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Custom data entry, format "key=value" (repeatable)
        #[arg(long = "data")]
        data: Vec<String>,
    },
    /// Stop and delete a scheduled action
    Unregister {
        /// The action id
        action_id: String,
    },
}

#[derive(Serialize)]
struct RegisterOutput {
    action_id: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_data(entries: &[String]) -> Result<HashMap<String, String>, Box<dyn std::error::Error>> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(format!("invalid data entry {:?}, expected key=value", entry).into()),
        })
        .collect()
}

fn build_dispatcher(
    args: &ServerArgs,
    store: Arc<dyn CoordinationStore>,
    config: &SchedulerConfig,
) -> ActionDispatcher {
    let mut dispatcher = ActionDispatcher::new();
    let task_handler = Arc::new(TaskRecordHandler::new(store, config.tasks_prefix()));
    for action_type in parse_list(&args.task_types) {
        dispatcher.register(action_type, task_handler.clone());
    }
    for action_type in parse_list(&args.log_types) {
        dispatcher.register(action_type, Arc::new(LogActionHandler));
    }
    dispatcher
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut config = SchedulerConfig::new(
        args.prefixes.scheduling_prefix.as_str(),
        args.prefixes.service_prefix.as_str(),
    )
    .with_watch_wait(Duration::from_secs(args.watch_wait_secs))
    .with_session_ttl(Duration::from_secs(args.session_ttl_secs))
    .with_stop_grace(Duration::from_secs(args.stop_grace_secs));
    if let Some(addr) = dashboard_addr {
        config = config.with_dashboard(addr);
    }

    let store: Arc<dyn CoordinationStore> = if args.in_memory {
        tracing::warn!("Running with an in-memory store, state is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(ConsulStore::new(args.consul.to_config())?)
    };

    let dispatcher = build_dispatcher(&args, store.clone(), &config);
    if dispatcher.action_types().is_empty() {
        tracing::warn!("No action type handlers configured, every dispatch will fail");
    }

    let backend = if args.in_memory {
        "in-memory"
    } else {
        args.consul.consul_addr.as_str()
    };
    tracing::info!(
        scheduling_prefix = %config.scheduling_prefix,
        leader_key = %config.leader_key(),
        store = %backend,
        dashboard_addr = ?config.dashboard_addr,
        action_types = ?dispatcher.action_types(),
        "Starting action scheduler"
    );

    let scheduler = Scheduler::new(config.clone(), store, dispatcher)?;
    let stopped = stop_on_signal(scheduler.clone())?;
    scheduler.start();

    let dashboard = config.dashboard_addr.map(|addr| {
        let state = DashboardState {
            scheduler: scheduler.clone(),
        };
        tokio::spawn(run_dashboard(addr, state, scheduler.shutdown_token()))
    });

    if let Err(e) = stopped.await {
        tracing::error!(error = %e, "Shutdown task failed");
        scheduler.stop().await;
    }

    if let Some(handle) = dashboard {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Dashboard task failed");
        }
    }

    Ok(())
}

// =============================================================================
// Action Command Handlers
// =============================================================================

async fn handle_action_command(
    consul: ConsulArgs,
    prefixes: PrefixArgs,
    output: OutputFormat,
    command: ActionCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = ConsulStore::new(consul.to_config())?;
    let config = SchedulerConfig::new(prefixes.scheduling_prefix, prefixes.service_prefix);

    match command {
        ActionCommands::Register {
            action_type,
            interval,
            deployment_id,
            id,
            data,
        } => {
            let mut definition = ActionDefinition::new(action_type, deployment_id, interval);
            definition.id = id;
            definition.data = parse_data(&data)?;

            let action_id = register_action(&store, &config, &definition).await?;
            match output {
                OutputFormat::Json => {
                    let out = RegisterOutput { action_id };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    println!("Action registered successfully!");
                    println!("Action ID: {}", action_id);
                }
            }
        }
        ActionCommands::Unregister { action_id } => {
            unregister_action(&store, &config, &action_id).await?;
            println!("Action {} flagged for unregistration", action_id);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Action {
            consul,
            prefixes,
            output,
            command,
        } => {
            handle_action_command(consul, prefixes, output, command).await?;
        }
    }

    Ok(())
}
