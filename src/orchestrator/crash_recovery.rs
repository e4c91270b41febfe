//! Checkpoint-aware crash recovery for supervised chat sessions.
//!
//! A [`CrashEvent`] handed to [`CrashRecovery::handle_crash`] produces the
//! lifecycle events `CrashDetected`, `RestartInitiated` and then
//! `RestartCompleted` or `RestartFailed`. Restarts are serialized across
//! supervisors by the `recovery:restart` lock and rate-limited to
//! `max_restarts` per restart window. Counters live in a small JSON
//! document that is re-read under the lock on every crash, so several
//! supervisors sharing the file agree on the count.
//!
//! [`spawn_crash_watch`] bridges the worker registry to this logic: it polls
//! for crashed workers and feeds each newly crashed one in exactly once.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RecoveryConfig;
use crate::coordination::{AcquireOptions, LockManager, WorkerRegistry};
use crate::models::recovery::{CrashEvent, RecoveryEvent, RecoveryState};
use crate::models::worker::{Worker, WorkerHealth, WorkerStatus};
use crate::persistence::recovery_state;
use crate::{AppError, Result};

/// Lock serializing restarts across supervisors.
pub const RESTART_LOCK: &str = "recovery:restart";

/// Crash metadata key naming the crashed worker.
pub const META_WORKER_ID: &str = "worker_id";
/// Crash metadata key naming the chat to reopen.
pub const META_CHAT_URL: &str = "chat_url";

/// Extra lock lifetime on top of the restart delay, covering the launch.
const LAUNCH_GRACE: Duration = Duration::from_secs(60);

/// Boxed future returned by [`SessionLauncher::launch`].
pub type LaunchFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<u32>>> + Send + 'a>>;

/// Starts a replacement chat session.
pub trait SessionLauncher: Send + Sync {
    /// Launch a session, reopening `chat_url` when given. Resolves to the
    /// new process id when known.
    fn launch<'a>(&'a self, chat_url: Option<&'a str>) -> LaunchFuture<'a>;
}

/// [`SessionLauncher`] running a configured command with the chat URL as
/// its final argument.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    /// Build from an argv list (`program arg...`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `argv` is empty.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AppError::Config("recovery.restart_command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl SessionLauncher for CommandLauncher {
    fn launch<'a>(&'a self, chat_url: Option<&'a str>) -> LaunchFuture<'a> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if let Some(url) = chat_url {
                cmd.arg(url);
            }

            let mut child = cmd.spawn().map_err(|err| {
                AppError::Launch(format!("failed to spawn {}: {err}", self.program))
            })?;
            let pid = child.id();
            info!(program = %self.program, pid = pid.unwrap_or(0), "session relaunched");

            // Reap the child so it does not linger as a zombie.
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!(%status, "relaunched session exited"),
                    Err(err) => warn!(%err, "failed to wait on relaunched session"),
                }
            });
            Ok(pid)
        })
    }
}

/// What [`CrashRecovery::handle_crash`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A replacement session was launched.
    Restarted {
        /// Attempt within the current window.
        attempt: u32,
        /// New process id, when known.
        pid: Option<u32>,
    },
    /// Another supervisor holds the restart lock.
    Skipped,
    /// `max_restarts` already reached in this window.
    LimitReached {
        /// Restarts counted in the window.
        restarts: u32,
    },
    /// The launch failed.
    Failed {
        /// Attempt that failed.
        attempt: u32,
        /// Launcher error.
        reason: String,
    },
}

/// Restart policy and collaborators for crash handling.
pub struct CrashRecovery {
    max_restarts: u32,
    restart_window: chrono::Duration,
    restart_delay: Duration,
    state_path: PathBuf,
    locks: Arc<LockManager>,
    launcher: Arc<dyn SessionLauncher>,
    events: mpsc::Sender<RecoveryEvent>,
}

impl CrashRecovery {
    /// Create crash recovery emitting lifecycle events on `events`.
    #[must_use]
    pub fn new(
        config: &RecoveryConfig,
        state_path: impl Into<PathBuf>,
        locks: Arc<LockManager>,
        launcher: Arc<dyn SessionLauncher>,
        events: mpsc::Sender<RecoveryEvent>,
    ) -> Self {
        Self {
            max_restarts: config.max_restarts,
            restart_window: chrono::Duration::seconds(
                i64::try_from(config.restart_window_seconds).unwrap_or(i64::MAX),
            ),
            restart_delay: Duration::from_secs(config.restart_delay_seconds),
            state_path: state_path.into(),
            locks,
            launcher,
            events,
        }
    }

    /// Lock manager used for restart serialization.
    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Path of the persisted recovery state.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Read the persisted recovery state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` or `AppError::Serialization` if the document
    /// cannot be read.
    pub fn current_state(&self) -> Result<RecoveryState> {
        recovery_state::load(&self.state_path)
    }

    /// Record the chat the supervised session is working in.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the document cannot be written.
    pub fn set_current_chat_url(&self, chat_url: &str) -> Result<()> {
        let mut state = recovery_state::load(&self.state_path)?;
        state.current_chat_url = Some(chat_url.to_owned());
        recovery_state::save(&self.state_path, &state)
    }

    async fn emit(&self, event: RecoveryEvent) {
        if self.events.send(event).await.is_err() {
            debug!("recovery event receiver dropped");
        }
    }

    /// Handle one crash: restart the session unless another supervisor is
    /// already doing so or the restart limit is reached.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the lock store is unreachable and
    /// `AppError::Io` if the state document cannot be read or written.
    /// Launch failures are an `Ok(RecoveryOutcome::Failed)`.
    pub async fn handle_crash(&self, event: CrashEvent) -> Result<RecoveryOutcome> {
        let span = info_span!(
            "handle_crash",
            pid = event.pid.unwrap_or(0),
            worker_id = event.metadata.get(META_WORKER_ID).map_or("", String::as_str)
        );
        self.handle_inner(event).instrument(span).await
    }

    fn lock_options(&self) -> AcquireOptions {
        AcquireOptions::default().with_ttl(self.restart_delay.saturating_add(LAUNCH_GRACE))
    }

    async fn handle_inner(&self, event: CrashEvent) -> Result<RecoveryOutcome> {
        warn!(at = %event.timestamp, "crash detected");
        self.emit(RecoveryEvent::CrashDetected {
            event: event.clone(),
        })
        .await;

        let Some(token) = self.locks.acquire(RESTART_LOCK, self.lock_options()).await? else {
            info!("restart already in progress elsewhere, skipping");
            return Ok(RecoveryOutcome::Skipped);
        };

        let outcome = self.restart_locked(&event).await;

        if let Err(err) = self.locks.release(RESTART_LOCK, &token).await {
            warn!(%err, "failed to release restart lock");
        }
        outcome
    }

    async fn restart_locked(&self, event: &CrashEvent) -> Result<RecoveryOutcome> {
        let now = Utc::now();
        let mut state = recovery_state::load(&self.state_path)?;

        if let Some(url) = event.metadata.get(META_CHAT_URL) {
            state.current_chat_url = Some(url.clone());
        }

        let window_expired = state
            .window_started_at
            .is_none_or(|started| now - started >= self.restart_window);
        if window_expired {
            state.restart_count = 0;
            state.window_started_at = Some(now);
        }

        if state.restart_count >= self.max_restarts {
            recovery_state::save(&self.state_path, &state)?;
            warn!(
                restarts = state.restart_count,
                max_restarts = self.max_restarts,
                "restart limit reached"
            );
            self.emit(RecoveryEvent::RestartFailed {
                attempt: 0,
                reason: format!(
                    "restart limit reached ({} in window)",
                    state.restart_count
                ),
            })
            .await;
            return Ok(RecoveryOutcome::LimitReached {
                restarts: state.restart_count,
            });
        }

        let attempt = state.restart_count + 1;
        state.restart_count = attempt;
        state.total_restarts = state.total_restarts.saturating_add(1);
        state.last_restart_at = Some(now);
        // Counted before launching so a crash loop cannot outrun the limit.
        recovery_state::save(&self.state_path, &state)?;

        if !self.restart_delay.is_zero() {
            tokio::time::sleep(self.restart_delay).await;
        }

        let chat_url = state.current_chat_url.clone();
        info!(attempt, chat_url = chat_url.as_deref().unwrap_or(""), "restart initiated");
        self.emit(RecoveryEvent::RestartInitiated {
            attempt,
            chat_url: chat_url.clone(),
        })
        .await;

        match self.launcher.launch(chat_url.as_deref()).await {
            Ok(pid) => {
                info!(attempt, pid = pid.unwrap_or(0), "restart completed");
                self.emit(RecoveryEvent::RestartCompleted { attempt, pid })
                    .await;
                Ok(RecoveryOutcome::Restarted { attempt, pid })
            }
            Err(err) => {
                error!(attempt, %err, "restart failed");
                let reason = err.to_string();
                self.emit(RecoveryEvent::RestartFailed {
                    attempt,
                    reason: reason.clone(),
                })
                .await;
                Ok(RecoveryOutcome::Failed { attempt, reason })
            }
        }
    }
}

fn crash_event_for(worker: &Worker) -> CrashEvent {
    let mut metadata = BTreeMap::new();
    metadata.insert(META_WORKER_ID.to_owned(), worker.worker_id.clone());
    metadata.insert(META_CHAT_URL.to_owned(), worker.chat_id.clone());
    metadata.insert("last_heartbeat".to_owned(), worker.last_heartbeat.to_rfc3339());
    metadata.insert("detector".to_owned(), "heartbeat".to_owned());
    CrashEvent::now(None, metadata)
}

/// Spawn the crash-watch loop.
///
/// Every `interval` the registry is scanned; each crashed worker whose
/// status is not yet `Crashed` is claimed under a per-worker lock and
/// handed to [`CrashRecovery::handle_crash`] (see [`scan_once`]).
#[must_use]
pub fn spawn_crash_watch(
    registry: Arc<WorkerRegistry>,
    recovery: Arc<CrashRecovery>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("crash watch shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                if let Err(err) = scan_once(&registry, &recovery).await {
                    error!(%err, "crash scan failed");
                }
            }
        }
        .instrument(info_span!("crash_watch")),
    )
}

/// One crash-watch pass. Returns how many crashes were settled.
///
/// A crash is settled once recovery restarted the session, failed to, or
/// hit the restart limit; the worker is then marked `Crashed`. A crash
/// skipped because another restart was in progress, or whose handling
/// errored, is left pending for the next pass.
///
/// # Errors
///
/// Returns `AppError::Unavailable` if the registry or lock store is
/// unreachable while listing or claiming crashed workers.
pub async fn scan_once(registry: &WorkerRegistry, recovery: &CrashRecovery) -> Result<usize> {
    let mut handled = 0;

    for worker in registry.get_crashed_workers().await? {
        if worker.status == WorkerStatus::Crashed {
            continue;
        }

        let claim = format!("recovery:claim:{}", worker.worker_id);
        let Some(token) = recovery
            .locks()
            .acquire(&claim, recovery.lock_options())
            .await?
        else {
            debug!(worker_id = %worker.worker_id, "crash claimed by another supervisor");
            continue;
        };

        match recover_claimed(registry, recovery, &worker).await {
            Ok(true) => handled += 1,
            Ok(false) => {}
            Err(err) => error!(worker_id = %worker.worker_id, %err, "crash handling failed"),
        }

        if let Err(err) = recovery.locks().release(&claim, &token).await {
            warn!(worker_id = %worker.worker_id, %err, "failed to release crash claim");
        }
    }

    Ok(handled)
}

/// Handle one claimed crash. Returns `true` when the crash was settled.
async fn recover_claimed(
    registry: &WorkerRegistry,
    recovery: &CrashRecovery,
    worker: &Worker,
) -> Result<bool> {
    // Re-read under the claim: another supervisor may have finished first,
    // or the worker may have resumed heartbeating.
    let still_pending = registry
        .get_worker(&worker.worker_id)
        .await?
        .is_some_and(|current| {
            current.health == WorkerHealth::Crashed && current.status != WorkerStatus::Crashed
        });
    if !still_pending {
        return Ok(false);
    }

    let outcome = recovery.handle_crash(crash_event_for(worker)).await?;
    if outcome == RecoveryOutcome::Skipped {
        debug!(worker_id = %worker.worker_id, "restart in progress elsewhere, retrying next pass");
        return Ok(false);
    }
    debug!(worker_id = %worker.worker_id, ?outcome, "crash handled");

    registry
        .update_status(&worker.worker_id, WorkerStatus::Crashed, None)
        .await?;
    Ok(true)
}
