use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use calc_dispatch::config::{DispatcherConfig, NoCapacityPolicy, WorkerConfig};
use calc_dispatch::dispatcher::Operator;
use calc_dispatch::shutdown::install_shutdown_handler;
use calc_dispatch::store::MemoryStore;
use calc_dispatch::worker::WorkerAgent;

#[derive(Parser, Debug)]
#[command(name = "calc-dispatch")]
#[command(version)]
#[command(about = "A distributed calculation dispatcher with worker-pool coordination")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatcher control plane
    Dispatcher(DispatcherArgs),

    /// Start a worker agent
    Worker(WorkerArgs),
}

// =============================================================================
// Dispatcher Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DispatcherArgs {
    /// Namespace whose objects this dispatcher manages
    #[arg(long, default_value = "calc-dispatch")]
    namespace: String,

    /// Root of the shared filesystem where factory output files land
    #[arg(long, default_value = "/var/lib/calc-dispatch")]
    shared_root: PathBuf,

    /// Capacity of the calculation hand-off channel
    #[arg(long, default_value = "64")]
    channel_capacity: usize,

    /// Re-offer calculations after this many milliseconds when no worker is
    /// available, instead of dropping them
    #[arg(long)]
    requeue_delay_ms: Option<u64>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Namespace this worker operates in
    #[arg(long, default_value = "calc-dispatch")]
    namespace: String,

    /// Worker pool to register into
    #[arg(long, default_value = "default")]
    pool: String,

    /// Stable node identity (key of the pool entry)
    #[arg(long)]
    nodename: String,

    /// Display name reported in the pool entry (defaults to the nodename)
    #[arg(long)]
    hostname: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "10000")]
    heartbeat_interval_ms: u64,
}

// =============================================================================
// Subcommand Implementations
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_dispatcher(args: DispatcherArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = DispatcherConfig::new(args.namespace);
    config.shared_root = args.shared_root;
    config.scheduler.channel_capacity = args.channel_capacity;
    if let Some(delay_ms) = args.requeue_delay_ms {
        config.scheduler.no_capacity_policy = NoCapacityPolicy::Requeue { delay_ms };
    }

    let store = MemoryStore::new();
    let cancel = install_shutdown_handler();
    Operator::new(store, config).run(cancel).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = WorkerConfig::new(args.pool, args.nodename.clone());
    config.namespace = args.namespace;
    config.hostname = args.hostname.unwrap_or(args.nodename);
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;

    let store = MemoryStore::new();
    let cancel = install_shutdown_handler();
    let (agent, executor) = WorkerAgent::new(store, config);

    // The executor attaches through the library API; a bare agent keeps the
    // channels open so assigned work waits instead of erroring out.
    tracing::warn!("No executor embedded, assigned calculations will wait");
    let _executor = executor;

    agent.run(cancel).await?;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Dispatcher(dispatcher_args) => run_dispatcher(dispatcher_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
    }

    Ok(())
}
