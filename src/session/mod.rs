pub mod context;
pub mod manager;
pub mod monitor;
pub mod watchdog;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::broadcast::SessionView;
use crate::cli::CliAdapter;
use crate::task::TaskStatus;
use crate::terminal::{TerminalAdapter, WindowHandle};

pub use context::ContextTracker;
pub use manager::{SessionManager, StartOutcome};
pub use watchdog::Watchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    /// Slot released, window closed, record kept for later resume.
    Paused,
    Stopping,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Events published by session monitors to the orchestrator's event loop.
/// Each carries the session epoch so events from a replaced session are
/// recognizably stale.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub task_id: String,
    pub epoch: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    /// A fresh context reading was accepted by the tracker.
    ContextObserved(u8),
    /// Remaining context crossed the restart threshold.
    ContextExhausted,
}

/// One live supervised CLI execution. Immutable identity plus a few
/// monitor-updated fields behind short-lived locks; the heavy state
/// (adapters, window handle) never changes after spawn.
pub struct Session {
    pub task_id: String,
    /// Monotone spawn counter; bumped on every restart of the same task.
    pub epoch: u64,
    pub cli: CliAdapter,
    pub terminal: TerminalAdapter,
    pub handle: WindowHandle,
    pub started_at: DateTime<Utc>,

    phase: Mutex<RunPhase>,
    last_activity: Mutex<DateTime<Utc>>,
    idle_since: Mutex<Option<Instant>>,
    context: Mutex<ContextTracker>,
    restart_requested: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(
        task_id: String,
        epoch: u64,
        cli: CliAdapter,
        terminal: TerminalAdapter,
        handle: WindowHandle,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            task_id,
            epoch,
            cli,
            terminal,
            handle,
            started_at: Utc::now(),
            phase: Mutex::new(RunPhase::Running),
            last_activity: Mutex::new(Utc::now()),
            idle_since: Mutex::new(None),
            context: Mutex::new(ContextTracker::new()),
            restart_requested: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: RunPhase) {
        *self.phase.lock() = phase;
        if phase != RunPhase::Running {
            // Monitors only run for running sessions.
            let _ = self.stop_tx.send(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase() == RunPhase::Running
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Marks the session as recently alive; called on any observed output
    /// change and on every CLI callback.
    pub fn mark_activity(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    pub(crate) fn note_idle(&self) {
        let mut idle = self.idle_since.lock();
        if idle.is_none() {
            *idle = Some(Instant::now());
        }
    }

    pub(crate) fn note_busy(&self) {
        *self.idle_since.lock() = None;
    }

    /// How long the CLI has been sitting at its idle prompt, if it is.
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.idle_since.lock().map(|since| since.elapsed())
    }

    /// Feeds a context reading through the monotone filter. Returns the
    /// accepted value, or `None` when the reading was stale/ignored.
    pub fn observe_context(&self, percent: u8) -> Option<u8> {
        self.context.lock().observe(percent)
    }

    pub fn context_remaining(&self) -> Option<u8> {
        self.context.lock().last_percent()
    }

    pub(crate) fn should_restart(&self, config: &crate::config::ContextConfig) -> bool {
        self.context.lock().should_restart(config)
    }

    /// Latches the restart request so a session advises at most one
    /// context restart per epoch.
    pub(crate) fn claim_restart(&self) -> bool {
        !self.restart_requested.swap(true, Ordering::SeqCst)
    }

    pub fn view(&self, status: TaskStatus) -> SessionView {
        SessionView {
            task_id: self.task_id.clone(),
            status,
            cli_type: self.cli.kind().as_str().to_string(),
            terminal: self.terminal.kind().as_str().to_string(),
            pid: self.handle.pid,
            started_at: self.started_at,
            context_remaining: self.context_remaining(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("task_id", &self.task_id)
            .field("epoch", &self.epoch)
            .field("cli", &self.cli.kind())
            .field("terminal", &self.terminal.kind())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{CliKind, CliProfile};
    use crate::terminal::TerminalChoice;

    fn session() -> Session {
        let cli = CliAdapter::ClaudeCode(CliProfile {
            command: "/usr/bin/true".into(),
            extra_args: vec![],
        });
        let terminal = TerminalAdapter::resolve(TerminalChoice::Headless).unwrap();
        Session::new("t1".to_string(), 1, cli, terminal, WindowHandle::default())
    }

    #[test]
    fn test_phase_changes_trip_stop_signal() {
        let s = session();
        let rx = s.stop_signal();
        assert!(!*rx.borrow());

        s.set_phase(RunPhase::Stopping);
        assert!(*rx.borrow());
        assert!(!s.is_running());
    }

    #[test]
    fn test_idle_tracking_resets_on_activity() {
        let s = session();
        assert!(s.idle_for().is_none());

        s.note_idle();
        assert!(s.idle_for().is_some());

        s.note_busy();
        assert!(s.idle_for().is_none());
    }

    #[test]
    fn test_restart_claimed_once() {
        let s = session();
        assert!(s.claim_restart());
        assert!(!s.claim_restart());
    }

    #[test]
    fn test_view_carries_cli_and_terminal_kinds() {
        let s = session();
        s.observe_context(42);
        let view = s.view(TaskStatus::InProgress);
        assert_eq!(view.task_id, "t1");
        assert_eq!(view.cli_type, CliKind::ClaudeCode.as_str());
        assert_eq!(view.terminal, "headless");
        assert_eq!(view.context_remaining, Some(42));
    }
}
