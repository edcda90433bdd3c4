use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::config::CadenceConfig;
use cadence_scheduler::{
    ChannelDispatcher, Clock, Coordinator, DispatchRequest, Dispatcher, EngineSettings,
    MemoryCoordinator, RedisCoordinator, RedisQueueDispatcher, SchedulerEngine,
    SqliteScheduleStore, SystemClock,
};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

mod admin;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CADENCE_GIT_SHA"), ")");

#[derive(Parser)]
#[command(name = "cadence-beat", about = "Persistent periodic-task scheduler", version = VERSION)]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(long, short = 'c')]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C (default)
    Run,
    /// List schedule entries
    List {
        /// Include disabled entries
        #[arg(long)]
        all: bool,
    },
    /// Add a schedule entry
    Add(admin::AddArgs),
    /// Enable an entry by name
    Enable { name: String },
    /// Disable an entry by name
    Disable { name: String },
    /// Delete an entry by name
    Remove { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_beat=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config =
        CadenceConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(open_store(&config.database.path, clock.clone())?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, store, clock).await,
        Command::List { all } => admin::list(&store, all),
        Command::Add(args) => admin::add(&store, args).await,
        Command::Enable { name } => admin::set_enabled(&store, &name, true).await,
        Command::Disable { name } => admin::set_enabled(&store, &name, false).await,
        Command::Remove { name } => admin::remove(&store, &name).await,
    }
}

fn open_store(db_path: &str, clock: Arc<dyn Clock>) -> anyhow::Result<SqliteScheduleStore> {
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    // Several beat processes and admin commands may share the file.
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    db.busy_timeout(Duration::from_secs(5))?;
    Ok(SqliteScheduleStore::new(db, clock)?)
}

async fn run(
    config: CadenceConfig,
    store: Arc<SqliteScheduleStore>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    let settings = EngineSettings::from_config(&config)?;

    let coordinator: Arc<dyn Coordinator> = match config.lock.redis_url.as_deref() {
        Some(url) => {
            info!("leader lock backed by Redis");
            Arc::new(RedisCoordinator::connect(url).await?)
        }
        None => {
            warn!("lock.redis_url not set; leadership only covers this process");
            Arc::new(MemoryCoordinator::new(clock.clone()))
        }
    };

    let dispatcher: Arc<dyn Dispatcher> = match config.dispatch.redis_url.as_deref() {
        Some(url) => {
            info!(default_queue = %config.dispatch.default_queue, "dispatching to Redis queues");
            Arc::new(RedisQueueDispatcher::connect(url, config.dispatch.default_queue.clone()).await?)
        }
        None => {
            info!("dispatch.redis_url not set; fired entries are only logged");
            let (tx, rx) = mpsc::channel::<DispatchRequest>(256);
            tokio::spawn(log_fired(rx));
            Arc::new(ChannelDispatcher::new(tx))
        }
    };

    let engine = SchedulerEngine::new(store, coordinator, dispatcher, clock, settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));
    info!("cadence beat {} running", VERSION);

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping");
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    Ok(())
}

/// Drain the in-process dispatch channel when no broker is configured.
async fn log_fired(mut rx: mpsc::Receiver<DispatchRequest>) {
    while let Some(request) = rx.recv().await {
        let args = serde_json::to_string(&request.args).unwrap_or_default();
        let kwargs = serde_json::to_string(&request.kwargs).unwrap_or_default();
        info!(
            entry = %request.entry,
            task = %request.task,
            %args,
            %kwargs,
            scheduled_at = %request.scheduled_at,
            "entry fired"
        );
    }
}

fn ensure_parent_dir(path: &str) {
    let Some(parent) = std::path::Path::new(path).parent() else {
        return;
    };
    if parent.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(parent) {
        warn!(dir = %parent.display(), error = %e, "could not create database directory");
    }
}
