#![forbid(unsafe_code)]

//! `chat-fleet` fleet supervisor binary.
//!
//! Opens the shared coordination store and the checkpoint history, watches
//! the worker registry for crashed sessions and relaunches them, and
//! optionally registers and heartbeats one chat worker of its own.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use chat_fleet::config::GlobalConfig;
use chat_fleet::coordination::{HeartbeatHandle, HeartbeatTicker, LockManager, WorkerRegistry};
use chat_fleet::models::recovery::RecoveryEvent;
use chat_fleet::models::worker::WorkerInfo;
use chat_fleet::orchestrator::crash_recovery::{self, CommandLauncher, CrashRecovery};
use chat_fleet::orchestrator::resume_detector::{resume_prompt_for, ResumeDetector};
use chat_fleet::persistence::checkpoint_repo::SqliteCheckpointRepo;
use chat_fleet::persistence::signal_repo::SignalHistoryRepo;
use chat_fleet::persistence::{db, retention};
use chat_fleet::store::{SharedStore, SqliteStore};
use chat_fleet::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "chat-fleet", about = "Chat fleet supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Register this process as a worker with the given id and heartbeat it.
    #[arg(long, requires = "chat_id")]
    worker_id: Option<String>,

    /// Chat driven by the registered worker.
    #[arg(long, requires = "worker_id")]
    chat_id: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("chat-fleet supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(GlobalConfig::load_from_path(&args.config)?);
    info!("configuration loaded");

    // ── Open stores ─────────────────────────────────────
    let store_pool = Arc::new(db::open_file(&config.store_path).await?);
    let sqlite_store = SqliteStore::open(store_pool).await?;
    let purged = sqlite_store.purge_expired().await?;
    let store: Arc<dyn SharedStore> = Arc::new(sqlite_store);
    info!(path = %config.store_path.display(), purged, "coordination store opened");

    let history = Arc::new(db::connect(&config.db_path).await?);
    info!(path = %config.db_path.display(), "checkpoint history opened");

    // ── Start retention service ──────────────────────────
    let ct = CancellationToken::new();
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&history), config.retention_days, ct.clone());
    info!("retention service started");

    // ── Coordination primitives ─────────────────────────
    let locks = Arc::new(LockManager::with_prefix(
        Arc::clone(&store),
        config.lock.key_prefix.clone(),
    ));
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&store),
        config.heartbeat_timeout(),
    ));

    // ── Optional own worker ─────────────────────────────
    let mut heartbeat: Option<HeartbeatHandle> = None;
    if let (Some(worker_id), Some(chat_id)) = (&args.worker_id, &args.chat_id) {
        report_resume(&history, chat_id).await;
        registry
            .register(worker_id, WorkerInfo::idle(chat_id.clone()))
            .await?;
        heartbeat = Some(
            HeartbeatTicker::new(
                Arc::clone(&registry),
                worker_id.clone(),
                config.heartbeat_interval(),
                ct.child_token(),
            )
            .spawn(),
        );
    }

    // ── Crash watch ─────────────────────────────────────
    let watch_handle = if config.recovery.restart_command.is_empty() {
        warn!("recovery.restart_command not configured; crash watch disabled");
        None
    } else {
        let launcher = Arc::new(CommandLauncher::from_argv(&config.recovery.restart_command)?);
        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(log_recovery_events(event_rx));

        let recovery = Arc::new(CrashRecovery::new(
            &config.recovery,
            config.recovery_state_path.clone(),
            Arc::clone(&locks),
            launcher,
            event_tx,
        ));
        info!("crash watch started");
        Some(crash_recovery::spawn_crash_watch(
            Arc::clone(&registry),
            recovery,
            std::time::Duration::from_secs(config.recovery.poll_interval_seconds),
            ct.clone(),
        ))
    };

    info!("supervisor ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // ── Best-effort cleanup ─────────────────────────────
    if let Some(mut handle) = heartbeat {
        handle.stop().await;
    }
    if let Some(handle) = watch_handle {
        if let Err(err) = handle.await {
            error!(%err, "crash watch task failed");
        }
    }
    let released = locks.release_all().await;
    let unregistered = registry.shutdown().await;
    if let Err(err) = retention_handle.await {
        error!(%err, "retention task failed");
    }
    history.close().await;

    info!(released, unregistered, "chat-fleet shut down");
    Ok(())
}

/// Log whether the chat this process drives is resuming from a checkpoint.
async fn report_resume(history: &Arc<db::Database>, chat_id: &str) {
    let detector = ResumeDetector::new(Arc::new(SqliteCheckpointRepo::new(Arc::clone(history))))
        .with_signal_history(SignalHistoryRepo::new(Arc::clone(history)));

    match detector.check_resume(chat_id).await {
        Ok(detection) => {
            if let Some(prompt) = resume_prompt_for(&detection) {
                info!(
                    reason = detection.interruption_reason.describe(),
                    confidence = detection.confidence,
                    "resuming chat from checkpoint\n{}",
                    prompt.text
                );
            }
        }
        Err(err) => warn!(%err, "resume check failed"),
    }
}

async fn log_recovery_events(mut rx: mpsc::Receiver<RecoveryEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RecoveryEvent::RestartFailed { attempt, reason } => {
                warn!(attempt, %reason, "recovery: restart failed");
            }
            other => info!(event = ?other, "recovery event"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
