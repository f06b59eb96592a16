//! Node Registry
//!
//! Command-line front end for the persistent node registry: startup
//! reconciliation, inventory queries, administrative cleanup and a
//! long-running mode that keeps the pending-delete reaper going.

use backoff::ExponentialBackoff;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_registry::{
    NodeAnnouncement, NodeRecord, NodeRegistry, PendingDeleteReaper, ReconcileReport,
    RegistryConfig, Result, SqliteNodeStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node Registry - persistent ledger of connected agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "NODE_REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the configuration file)
    #[arg(long, env = "NODE_REGISTRY_DATABASE")]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Force every node recorded as online to offline
    Reconcile,

    /// List every node record
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a single node by its node id
    Show { node_id: String },

    /// Reconcile, then record a JSON announcement ("-" reads stdin)
    Announce { file: PathBuf },

    /// Record a node as disconnected
    Disconnect { node_id: String },

    /// Flag a node for removal
    MarkDelete { node_id: String },

    /// Purge offline nodes flagged for removal
    Purge {
        /// Override the configured grace period
        #[arg(long)]
        grace_secs: Option<u64>,
    },

    /// Reconcile, then keep the reaper running until Ctrl-C
    Run,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => RegistryConfig::from_yaml_file(path)?,
        None => RegistryConfig::default(),
    };
    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }
    config.validate()?;

    let store = SqliteNodeStore::open(&config.database_path, config.busy_timeout())?;
    info!(database = %config.database_path.display(), "Node store opened");
    let registry = NodeRegistry::new(Arc::new(store), config.reconcile.clone());

    match args.command {
        Command::Reconcile => {
            let report = reconcile_with_retry(&registry, &config).await?;
            println!(
                "scanned {} nodes, marked {} offline, {} already offline",
                report.scanned, report.corrected, report.already_offline
            );
        }
        Command::List { json } => {
            let records = registry.find_all()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    println!("{}", summary_line(record));
                }
            }
        }
        Command::Show { node_id } => {
            let record = registry.find_by_node_id(&node_id)?.require(&node_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Announce { file } => {
            let announcement = read_announcement(&file)?;
            let record = announce(&registry, &config, &announcement).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Disconnect { node_id } => {
            let record = registry.disconnect(&node_id)?;
            println!("{}", summary_line(&record));
        }
        Command::MarkDelete { node_id } => {
            let record = registry.mark_pending_delete(&node_id)?;
            println!("{}", summary_line(&record));
        }
        Command::Purge { grace_secs } => {
            let mut reaper_config = config.reaper.clone();
            if let Some(grace_secs) = grace_secs {
                reaper_config.grace_period_secs = grace_secs;
            }
            let report = PendingDeleteReaper::new(registry.clone(), reaper_config).sweep()?;
            println!(
                "purged {} nodes, skipped {}, failed {}",
                report.purged, report.skipped, report.failed
            );
        }
        Command::Run => run(registry, &config).await?,
    }

    Ok(())
}

/// Reconcile, retrying with exponential backoff while the failure is transient
async fn reconcile_with_retry(
    registry: &NodeRegistry,
    config: &RegistryConfig,
) -> Result<ReconcileReport> {
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(config.reconcile.retry_max_elapsed_secs)),
        ..Default::default()
    };

    backoff::future::retry(policy, move || async move {
        registry.reconcile_online_status().map_err(|e| {
            if e.is_transient() {
                warn!(error = %e, "Reconciliation failed, retrying");
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}

/// Record an announcement, reconciling first so stale online flags left by
/// a crashed server never sit beside the new record
async fn announce(
    registry: &NodeRegistry,
    config: &RegistryConfig,
    announcement: &NodeAnnouncement,
) -> Result<NodeRecord> {
    if !registry.is_reconciled() {
        reconcile_with_retry(registry, config).await?;
    }
    registry.announce(announcement)
}

async fn run(registry: Arc<NodeRegistry>, config: &RegistryConfig) -> Result<()> {
    info!("Starting node registry");
    info!("  Version: {}", node_registry::VERSION);
    info!("  Database: {}", config.database_path.display());
    info!("  Reaper enabled: {}", config.reaper.enabled);

    // Must finish before any node connection is accepted
    let report = reconcile_with_retry(&registry, config).await?;
    info!(corrected = report.corrected, "Registry ready to accept node connections");

    let cancel = CancellationToken::new();

    let mut events = registry.subscribe();
    let events_cancel = cancel.clone();
    let events_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => info!(%event, "Registry event"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Registry event stream lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let reaper_task = if config.reaper.enabled {
        let reaper = PendingDeleteReaper::new(registry.clone(), config.reaper.clone());
        Some(tokio::spawn(reaper.run(cancel.clone())))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Some(task) = reaper_task {
        let _ = task.await;
    }
    let _ = events_task.await;

    info!("Node registry shutdown complete");
    Ok(())
}

fn read_announcement(file: &Path) -> Result<NodeAnnouncement> {
    let contents = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(file)?
    };
    Ok(serde_json::from_str(&contents)?)
}

fn summary_line(record: &NodeRecord) -> String {
    format!(
        "{:>5}  {:<24} {:<20} {:<16} {:<8}{}",
        record.id,
        record.node_id,
        record.name,
        record.ip_address,
        if record.online { "online" } else { "offline" },
        if record.pending_delete { "  pending-delete" } else { "" },
    )
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Keep stdout clean for command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
