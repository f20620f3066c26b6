//! yasched — the yascheduler daemon.
//!
//! Hosts the scheduler loop, the cloud coordinator, and the webhook
//! worker in one process over a shared PostgreSQL state store.
//!
//! # Usage
//!
//! ```text
//! yasched init                          # create the database schema
//! yasched -c /etc/yascheduler/yascheduler.conf
//! yasched -p /var/run/yascheduler.pid -l /var/log/yascheduler.log
//! ```
//!
//! `YASCHEDULER_CONF_PATH`, `YASCHEDULER_PID_PATH` and
//! `YASCHEDULER_LOG_PATH` override the corresponding flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use yasched_cloud::CloudCoordinator;
use yasched_core::{Config, Gate};
use yasched_db::TaskStore;
use yasched_remote::{KeyStore, MachinePool};
use yasched_scheduler::{webhook_channel, Scheduler};

#[derive(Parser)]
#[command(name = "yasched", about = "yascheduler compute-job scheduler daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long, env = "YASCHEDULER_CONF_PATH")]
    config: Option<PathBuf>,

    /// Write the daemon pid to this file.
    #[arg(short = 'p', long, env = "YASCHEDULER_PID_PATH")]
    pidfile: Option<PathBuf>,

    /// Append logs to this file instead of stderr.
    #[arg(short = 'l', long, env = "YASCHEDULER_LOG_PATH")]
    logfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema and exit.
    Init,
}

/// Grace period for in-flight transfers on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.logfile.as_deref())?;

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let cfg = Arc::new(Config::from_file(&config_path)?);
    info!(path = %config_path.display(), engines = cfg.engines.len(), "configuration loaded");

    let db = TaskStore::connect(&cfg.db)?;

    if let Some(Command::Init) = cli.command {
        db.init_schema().await?;
        return Ok(());
    }

    if let Some(pidfile) = &cli.pidfile {
        std::fs::write(pidfile, std::process::id().to_string())?;
    }

    // Schema is migrated on every start; the statements are idempotent.
    db.init_schema().await?;
    std::fs::create_dir_all(&cfg.local.data_dir)?;
    std::fs::create_dir_all(&cfg.local.tasks_dir)?;

    let keys = KeyStore::load_or_generate(&cfg.local.keys_dir)?;
    let pool = Arc::new(MachinePool::new(
        keys.keypair.clone(),
        cfg.local.conn_machine_limit,
        cfg.local.conn_machine_pending,
    ));
    let allocate_gate = Arc::new(Gate::new(
        "allocate",
        cfg.local.allocate_limit,
        cfg.local.allocate_pending,
    ));

    let (coordinator, evict_tx) = CloudCoordinator::new(
        cfg.clone(),
        db.clone(),
        pool.clone(),
        keys,
        allocate_gate.clone(),
    );
    if coordinator.is_empty() {
        info!("no cloud providers configured, running with static nodes only");
    }
    let (webhook_queue, webhook_worker) = webhook_channel(cfg.local.webhook_reqs_limit);
    let scheduler = Scheduler::new(
        cfg.clone(),
        db,
        pool,
        webhook_queue,
        allocate_gate,
        evict_tx,
    );

    // ── Start background tasks ─────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let coordinator_handle = tokio::spawn(coordinator.run(shutdown_rx.clone()));
    let webhook_handle = tokio::spawn(webhook_worker.run(shutdown_rx));

    // A scheduler exit without a signal means a permanent database
    // error; take the whole daemon down with it.
    let scheduler_done;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            scheduler_done = false;
        }
        _ = &mut scheduler_handle => {
            tracing::error!("scheduler terminated, shutting down");
            scheduler_done = true;
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        if !scheduler_done {
            let _ = scheduler_handle.await;
        }
        let _ = coordinator_handle.await;
        let _ = webhook_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(grace = ?SHUTDOWN_GRACE, "grace period elapsed, exiting with work in flight");
    }

    if let Some(pidfile) = &cli.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    info!("yascheduler daemon stopped");
    Ok(())
}

fn init_tracing(logfile: Option<&std::path::Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,yasched=debug".parse().expect("static filter parses"));
    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
