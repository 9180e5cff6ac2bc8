//! StoreSync CLI - Command line interface for the branch sync engine.
//!
//! Captures mutations, inspects the outbox, runs dispatch cycles and
//! reports progress against a SQLite database or an in-memory store.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use storesync_common::{EntityType, Operation, OutboxStatus, Priority, StoreId, SyncSession};
use storesync_storage::{MemoryStore, OutboxQuery, SqliteStore, SyncStore};
use storesync_sync::{
    BranchStock, CycleTrigger, DiscrepancyFilter, QueueEvent, Severity, SyncConfig, SyncEngine,
    SyncMode,
};

type Engine = SyncEngine<dyn SyncStore>;

#[derive(Parser)]
#[command(name = "storesync")]
#[command(about = "StoreSync - Offline-first branch synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// SQLite database file. An in-memory store is used when absent.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a mutation in the outbox.
    Enqueue {
        /// Entity type tag (e.g. sale, product).
        #[arg(short = 't', long)]
        entity_type: String,

        /// Entity identifier.
        #[arg(short = 'i', long)]
        entity_id: String,

        /// Operation: create, update, delete or upsert.
        #[arg(short, long, default_value = "update")]
        operation: String,

        /// Payload as a JSON document.
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Explicit priority: high, normal or low.
        #[arg(long)]
        priority: Option<String>,
    },

    /// List outbox entries.
    List {
        /// Only entries with this status.
        #[arg(short, long)]
        status: Option<String>,

        /// Only entries of this entity type.
        #[arg(short = 't', long)]
        entity_type: Option<String>,

        /// Only flagged entries.
        #[arg(long)]
        conflicts: bool,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one outbox entry.
    Show {
        /// Outbox entry id.
        id: i64,
    },

    /// Outbox counts per entity type and priority.
    Stats,

    /// Resolve flagged entries.
    Resolve {
        /// Outbox entry ids.
        #[arg(required = true)]
        ids: Vec<i64>,

        /// Who resolved the conflict.
        #[arg(short, long)]
        by: String,
    },

    /// Put entries back to PENDING for another delivery.
    Replay {
        /// Outbox entry ids.
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Change the priority of an entry.
    SetPriority {
        /// Outbox entry id.
        id: i64,

        /// New priority: high, normal or low.
        priority: String,
    },

    /// Requeue FAILED entries older than the retry interval.
    Requeue,

    /// Run one dispatch cycle.
    Cycle {
        /// Restrict the cycle to one branch.
        #[arg(short, long)]
        store: Option<i64>,

        /// Who triggered the cycle.
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Capture an event in the hybrid queue.
    QueuePush {
        /// Event type.
        #[arg(short = 't', long)]
        event_type: String,

        /// Payload as a JSON document.
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Idempotency key.
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Attempt delivery of due hybrid queue entries.
    QueueDispatch,

    /// Completion per business module.
    Progress,

    /// Throughput and completion estimate.
    Forecast,

    /// Cross-branch stock discrepancies from a JSON file of aggregates.
    Discrepancies {
        /// JSON array of branch stock rows.
        #[arg(short, long)]
        file: PathBuf,

        /// Only these branches.
        #[arg(short, long)]
        store: Vec<i64>,

        /// Only this severity: warning or critical.
        #[arg(long)]
        severity: Option<String>,
    },

    /// Recent sync sessions.
    Sessions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Open conflicts and the discrepancies of the last cycle.
    Alerts,

    /// Run the scheduler until interrupted.
    Run {
        /// Tick period in seconds, overriding the configuration.
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "storesync", &mut std::io::stdout());
        return Ok(());
    }

    let engine = open_engine(cli.db.as_ref(), cli.config.as_ref())?;

    match cli.command {
        Commands::Enqueue {
            entity_type,
            entity_id,
            operation,
            payload,
            priority,
        } => cmd_enqueue(&engine, &entity_type, &entity_id, &operation, &payload, priority).await,

        Commands::List {
            status,
            entity_type,
            conflicts,
            offset,
            limit,
        } => cmd_list(&engine, status, entity_type, conflicts, offset, limit).await,

        Commands::Show { id } => print_json(&engine.get_entry(id).await?),

        Commands::Stats => print_json(&engine.stats().await?),

        Commands::Resolve { ids, by } => print_json(&engine.resolve(&ids, &by).await?),

        Commands::Replay { ids } => print_json(&engine.replay(&ids).await?),

        Commands::SetPriority { id, priority } => {
            let priority: Priority = priority.parse()?;
            print_json(&engine.set_priority(id, priority).await?)
        }

        Commands::Requeue => {
            let requeued = engine.requeue_failed().await?;
            info!("Requeued {} entries", requeued.len());
            print_json(&requeued)
        }

        Commands::Cycle { store, by } => {
            let report = engine
                .run_cycle(store.map(StoreId), CycleTrigger::manual(by))
                .await
                .context("Dispatch cycle failed")?;
            print_json(&report)
        }

        Commands::QueuePush {
            event_type,
            payload,
            key,
        } => {
            let mut event = QueueEvent::new(event_type, parse_payload(&payload)?);
            if let Some(key) = key {
                event = event.with_key(key);
            }
            print_json(&engine.enqueue_events(vec![event]).await?)
        }

        Commands::QueueDispatch => print_json(&engine.dispatch_queue().await?),

        Commands::Progress => print_json(&engine.progress().await?),

        Commands::Forecast => print_json(&engine.forecast().await?),

        Commands::Discrepancies {
            file,
            store,
            severity,
        } => cmd_discrepancies(&engine, &file, store, severity),

        Commands::Sessions { limit } => print_json(&engine.recent_sessions(limit).await?),

        Commands::Alerts => print_json(&engine.alerts().await?),

        Commands::Run { interval } => cmd_run(engine, interval).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Build an engine over the selected store and configuration.
fn open_engine(db: Option<&PathBuf>, config: Option<&PathBuf>) -> Result<Engine> {
    let config = match config {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let store: Arc<dyn SyncStore> = match db {
        Some(path) => {
            info!("Using database at: {}", path.display());
            Arc::new(
                SqliteStore::open(path)
                    .with_context(|| format!("Failed to open database {}", path.display()))?,
            )
        }
        None => Arc::new(MemoryStore::new()),
    };

    SyncEngine::builder(store)
        .config(config)
        .build()
        .context("Invalid configuration")
}

fn parse_payload(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).context("Payload is not valid JSON")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Capture one mutation.
async fn cmd_enqueue(
    engine: &Engine,
    entity_type: &str,
    entity_id: &str,
    operation: &str,
    payload: &str,
    priority: Option<String>,
) -> Result<()> {
    let entity_type = EntityType::new(entity_type).context("Invalid entity type")?;
    let operation: Operation = operation.parse()?;
    let priority = priority.map(|p| p.parse::<Priority>()).transpose()?;

    let entry = engine
        .enqueue(entity_type, entity_id, operation, parse_payload(payload)?, priority)
        .await
        .context("Failed to enqueue")?;
    if entry.conflict_flag {
        info!("Entry {} is flagged for review", entry.id);
    }
    print_json(&entry)
}

/// List a page of outbox entries.
async fn cmd_list(
    engine: &Engine,
    status: Option<String>,
    entity_type: Option<String>,
    conflicts: bool,
    offset: usize,
    limit: Option<usize>,
) -> Result<()> {
    let query = OutboxQuery {
        entity_type: entity_type.map(EntityType::new).transpose()?,
        status: status.map(|s| s.parse::<OutboxStatus>()).transpose()?,
        conflict_flag: conflicts.then_some(true),
        offset,
        limit,
        ..OutboxQuery::default()
    };
    print_json(&engine.list_entries(&query).await?)
}

/// Report discrepancies over aggregates read from a file.
fn cmd_discrepancies(
    engine: &Engine,
    file: &PathBuf,
    store: Vec<i64>,
    severity: Option<String>,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let rows: Vec<BranchStock> =
        serde_json::from_str(&raw).context("Expected a JSON array of branch stock rows")?;

    let filter = DiscrepancyFilter {
        store_ids: store.into_iter().map(StoreId).collect(),
        severity: severity.map(|s| s.parse::<Severity>()).transpose()?,
        ..DiscrepancyFilter::default()
    };
    print_json(&engine.report_discrepancies(&rows, &filter))
}

/// Run the scheduler until Ctrl-C.
async fn cmd_run(engine: Engine, interval: Option<u64>) -> Result<()> {
    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
    };
    let sessions = run_scheduler(engine, interval, stop).await?;
    print_json(&sessions)
}

/// Drive the scheduler and return the recent sessions.
///
/// Periodic mode ticks until `stop` resolves. Manual mode has nothing to
/// wait for, so it runs a single tick and returns.
async fn run_scheduler<F>(
    mut engine: Engine,
    interval: Option<u64>,
    stop: F,
) -> Result<Vec<SyncSession>>
where
    F: Future<Output = ()>,
{
    let handle = engine.init_scheduler();
    let engine = Arc::new(engine);
    let scheduler_engine = engine.clone();

    let task = tokio::spawn(handle.run(move |request| {
        let engine = scheduler_engine.clone();
        async move { engine.process_request(request).await }
    }));

    let scheduler = engine
        .scheduler()
        .context("Scheduler was not initialized")?;
    if let Some(secs) = interval {
        scheduler
            .set_mode(SyncMode::Periodic {
                interval: Duration::from_secs(secs.max(1)),
            })
            .await;
    }

    let tick = match scheduler.get_mode().await {
        SyncMode::Manual => {
            info!("Manual mode without --interval, running a single tick");
            Some(scheduler.request_sync(None, "cli").await)
        }
        mode => {
            info!("Scheduler running in {:?} mode, press Ctrl-C to stop", mode);
            stop.await;
            None
        }
    };

    info!("Stopping scheduler");
    scheduler.shutdown().await;
    task.await.context("Scheduler task panicked")?;

    if let Some(result) = tick {
        let report = result.context("Sync tick failed")?;
        info!(
            "Tick finished: {} sent, {} failed, {} queue events sent",
            report.cycle.sent, report.cycle.failed, report.queue.sent
        );
    }
    Ok(engine.recent_sessions(10).await?)
}
