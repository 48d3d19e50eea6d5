//! Supervisory sweep over all live sessions.
//!
//! One loop for the whole pool. Each sweep computes at most one verdict
//! per session (death outranks idleness) and hands it to the orchestrator;
//! a defective check logs and leaves the session for the next tick. The
//! loop itself never propagates an error, so one broken session cannot
//! halt supervision of the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Session;
use crate::config::WardenConfig;
use crate::orchestrator::Warden;
use crate::terminal::{Liveness, pid_alive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// The window or process is gone (or silent past the heartbeat limit).
    Died,
    /// Alive, but parked at the CLI's idle prompt.
    IdleLockup,
}

pub struct Watchdog;

impl Watchdog {
    pub fn spawn(warden: Arc<Warden>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = warden.config().snapshot().watchdog.check_interval_secs;
            info!(interval_secs = interval, "watchdog started");
            loop {
                let interval = Duration::from_secs(
                    warden.config().snapshot().watchdog.check_interval_secs,
                );
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                Self::sweep(&warden).await;
            }
            info!("watchdog stopped");
        })
    }

    async fn sweep(warden: &Warden) {
        let config = warden.config().snapshot();
        for session in warden.manager().sessions_snapshot() {
            if !session.is_running() {
                continue;
            }
            let Some(verdict) = Self::check(&session, &config).await else {
                continue;
            };
            debug!(
                task_id = %session.task_id,
                epoch = session.epoch,
                ?verdict,
                "watchdog verdict"
            );
            if let Err(e) = warden.handle_watchdog_verdict(&session, verdict).await {
                warn!(
                    task_id = %session.task_id,
                    error = %e,
                    "watchdog recovery action failed; will retry next sweep"
                );
            }
        }
    }

    async fn check(session: &Session, config: &WardenConfig) -> Option<WatchdogVerdict> {
        match session.terminal.is_alive(&session.handle).await {
            Liveness::Dead => return Some(WatchdogVerdict::Died),
            Liveness::Alive => {}
            Liveness::Unknown => {
                // The emulator cannot say; fall back to the OS, then to the
                // last observed activity (output changes and callbacks).
                if let Some(pid) = session.handle.pid {
                    if !pid_alive(pid) {
                        return Some(WatchdogVerdict::Died);
                    }
                } else {
                    let timeout = chrono::Duration::seconds(
                        config.watchdog.heartbeat_timeout_secs as i64,
                    );
                    if Utc::now() - session.last_activity() > timeout {
                        return Some(WatchdogVerdict::Died);
                    }
                }
            }
        }

        // Idle-lockup is distinct from death: the process lives but the
        // CLI has sat at its prompt for a full sweep interval. Whether
        // that means "done" or "stuck" is decided upstream against the
        // checkbox document.
        let sweep = Duration::from_secs(config.watchdog.check_interval_secs);
        if session.idle_for().is_some_and(|idle| idle >= sweep) {
            return Some(WatchdogVerdict::IdleLockup);
        }

        None
    }
}
