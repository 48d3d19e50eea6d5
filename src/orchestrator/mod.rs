//! The orchestration authority.
//!
//! `Warden` owns the task store shadow, the session pool, the watchdog,
//! and the broadcaster, and is the single writer for task state. Every
//! transition funnels through a per-task lock plus a session-epoch check,
//! so a CLI callback and an output-parsing event racing to finish the
//! same session cannot both win.

use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{StatusBroadcaster, StatusSnapshot, Subscriber};
use crate::cli::CliKind;
use crate::config::{ConfigHandle, WardenConfig};
use crate::error::{Result, WardenError};
use crate::session::manager::RespawnPrompt;
use crate::session::watchdog::WatchdogVerdict;
use crate::session::{
    Session, SessionEvent, SessionEventKind, SessionManager, StartOutcome, Watchdog,
};
use crate::task::{ProgressInspector, Task, TaskStatus, TaskStore, store};
use crate::template::{TemplateKind, TemplateStore, TemplateVars};

/// Status payload POSTed back by a spawned CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ReportedStatus,
    /// Percent of context remaining, when the CLI knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_remaining: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn status(status: ReportedStatus) -> Self {
        Self {
            status,
            context_remaining: None,
            message: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    InProgress,
    /// The CLI finished a working session; the document decides what next.
    SessionCompleted,
    Completed,
    Failed,
    ReviewSessionCompleted,
    ReviewCompleted,
}

/// What a `notify_status` call amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Acknowledged,
    SessionRestarted,
    ReviewStarted,
    TaskCompleted,
    TaskFailed,
    /// Arrived after the task already reached a terminal state; dropped
    /// without side effects.
    Ignored,
}

pub struct Warden {
    me: Weak<Warden>,
    config: ConfigHandle,
    store: Arc<dyn TaskStore>,
    templates: TemplateStore,
    manager: Arc<SessionManager>,
    broadcaster: StatusBroadcaster,
    progress: ProgressInspector,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    shutdown_tx: watch::Sender<bool>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Warden {
    pub fn new(config: WardenConfig, store: Arc<dyn TaskStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let templates = TemplateStore::new(&config.templates);
        let broadcaster = StatusBroadcaster::new(config.broadcast.queue_capacity);
        let config = ConfigHandle::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(SessionManager::new(config.clone(), events_tx));

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            store,
            templates,
            manager,
            broadcaster,
            progress: ProgressInspector::default(),
            locks: DashMap::new(),
            shutdown_tx,
            events_rx: Mutex::new(Some(events_rx)),
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Reconciles stale tasks from a previous run, then brings up the
    /// event loop and the watchdog.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.reconcile_startup()?;

        if let Some(events_rx) = self.events_rx.lock().take() {
            let warden = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            let event_loop = tokio::spawn(warden.run_event_loop(events_rx, shutdown));
            let watchdog = Watchdog::spawn(Arc::clone(self), self.shutdown_tx.subscribe());
            let mut handles = self.handles.lock();
            handles.push(event_loop);
            handles.push(watchdog);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        self.manager.stop_all().await;
        self.broadcaster.close();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    /// Tasks persisted as live from a previous process cannot be
    /// re-adopted: sessions are purely in-memory and the store records no
    /// process identifiers. Fail them so nothing dangles.
    fn reconcile_startup(&self) -> Result<()> {
        let mut reconciled = 0usize;
        for status in [TaskStatus::InProgress, TaskStatus::InReviewing] {
            for task in self.store.by_status(status)? {
                warn!(task_id = %task.id, status = %status, "stale live task from previous run");
                self.store.set_status(
                    &task.id,
                    TaskStatus::Failed,
                    Some("recovery failed: supervisor restarted while the session was live"),
                )?;
                reconciled += 1;
            }
        }
        if reconciled > 0 {
            info!(count = reconciled, "marked unrecoverable tasks as failed");
        }
        Ok(())
    }

    // ---- operator surface -------------------------------------------------

    pub async fn start_task(&self, task_id: &str) -> Result<StartOutcome> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id)?;
        if task.status != TaskStatus::Pending {
            return Err(WardenError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
                expected: "pending",
            });
        }
        store::validate_paths(&task.project_dir, &task.doc_path)?;
        self.launch_initial(&task).await
    }

    /// Operator stop. A task mid-work returns to `pending`; a task mid-
    /// review keeps its `completed` outcome, because the primary work is
    /// done. Stopping a task with no session (and no queue place) is a
    /// no-op that still succeeds.
    pub async fn stop_task(&self, task_id: &str) -> Result<()> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id)?;
        let had_session = self.manager.stop(task_id).await?;
        let dequeued = self.manager.remove_waiting(task_id);

        match task.status {
            TaskStatus::InProgress => {
                self.transition(task_id, TaskStatus::Pending, None)?;
                info!(task_id, "task stopped by operator, back to pending");
            }
            TaskStatus::InReviewing => {
                self.transition(task_id, TaskStatus::Completed, None)?;
                info!(task_id, "review stopped by operator, task completed");
            }
            _ => {}
        }

        if had_session || dequeued || task.status.has_session() {
            self.publish();
            self.spawn_queue_advance();
        }
        Ok(())
    }

    /// Soft stop: frees the slot and closes the window but leaves both the
    /// task status and the session record in place for a later restart.
    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        self.load_task(task_id)?;
        if self.manager.pause(task_id).await? {
            info!(task_id, "task paused");
            self.publish();
            self.spawn_queue_advance();
        }
        Ok(())
    }

    /// Operator restart: stop plus immediate re-start, keeping the slot.
    pub async fn restart_task(&self, task_id: &str) -> Result<StartOutcome> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id)?;
        if !task.status.has_session() {
            return Err(WardenError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
                expected: "in_progress or in_reviewing",
            });
        }

        let prompt = if task.status == TaskStatus::InReviewing {
            RespawnPrompt::Text(self.render_for(&task, TemplateKind::Review, None)?)
        } else {
            RespawnPrompt::Resume
        };
        let outcome = self.manager.respawn(&task, None, prompt).await?;
        self.publish();
        Ok(outcome)
    }

    /// Stops everything; each failure is collected rather than aborting
    /// the rest.
    pub async fn stop_all(&self) -> Vec<(String, WardenError)> {
        let mut task_ids: Vec<String> = self
            .manager
            .sessions_snapshot()
            .iter()
            .map(|s| s.task_id.clone())
            .collect();
        task_ids.extend(self.manager.queued());
        task_ids.dedup();

        let mut failures = Vec::new();
        for task_id in task_ids {
            if let Err(e) = self.stop_task(&task_id).await {
                warn!(task_id = %task_id, error = %e, "stop failed during stop_all");
                failures.push((task_id, e));
            }
        }
        failures
    }

    pub fn list_sessions(&self) -> StatusSnapshot {
        self.current_snapshot()
    }

    pub fn subscribe(&self) -> Subscriber {
        self.broadcaster.subscribe()
    }

    /// Advisory status from the CLI itself. Competes with output parsing
    /// through the same per-task arbiter: the first legal transition wins
    /// and late reports are dropped silently.
    pub async fn notify_status(
        &self,
        task_id: &str,
        report: StatusReport,
    ) -> Result<NotifyOutcome> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id)?;

        if let Some(session) = self.manager.session(task_id) {
            session.mark_activity();
            session.note_busy();
            if let Some(percent) = report.context_remaining
                && session.observe_context(percent).is_some()
            {
                self.publish();
            }
        }

        if task.status.is_terminal() {
            debug!(task_id, status = %task.status, reported = ?report.status, "late callback ignored");
            return Ok(NotifyOutcome::Ignored);
        }

        match report.status {
            ReportedStatus::InProgress => Ok(NotifyOutcome::Acknowledged),

            ReportedStatus::Completed | ReportedStatus::SessionCompleted => {
                let progress = self.progress.progress(&task.full_doc_path()).ok();
                match progress {
                    Some(p) if !p.is_complete() => {
                        // The claim does not hold up against the document:
                        // hand the remaining items to a fresh session.
                        info!(
                            task_id,
                            progress = %p.summary(),
                            "completion reported with work remaining, restarting session"
                        );
                        let prompt = self.render_for(&task, TemplateKind::ResumeTask, None)?;
                        self.respawn_or_fail(&task, None, RespawnPrompt::Text(prompt))
                            .await?;
                        Ok(NotifyOutcome::SessionRestarted)
                    }
                    _ => self.complete_work(&task).await,
                }
            }

            ReportedStatus::Failed => {
                if !task.status.has_session() {
                    return Ok(NotifyOutcome::Ignored);
                }
                let reason = report
                    .error
                    .or(report.message)
                    .unwrap_or_else(|| "CLI reported failure".to_string());
                self.fail_task(&task.id, &reason).await?;
                Ok(NotifyOutcome::TaskFailed)
            }

            ReportedStatus::ReviewSessionCompleted => {
                self.expect_reviewing(&task)?;
                let prompt = self.render_for(&task, TemplateKind::Review, None)?;
                self.respawn_or_fail(&task, None, RespawnPrompt::Text(prompt))
                    .await?;
                Ok(NotifyOutcome::SessionRestarted)
            }

            ReportedStatus::ReviewCompleted => {
                self.expect_reviewing(&task)?;
                self.finish_task(&task.id).await?;
                Ok(NotifyOutcome::TaskCompleted)
            }
        }
    }

    // ---- recovery plumbing ------------------------------------------------

    /// Applies a watchdog verdict. Stale epochs (the session was already
    /// replaced or removed) are dropped here, which is what coalesces
    /// multiple verdicts for one session into a single transition.
    pub(crate) async fn handle_watchdog_verdict(
        &self,
        session: &Arc<Session>,
        verdict: WatchdogVerdict,
    ) -> Result<()> {
        let task_id = session.task_id.clone();
        let lock = self.task_lock(&task_id);
        let _guard = lock.lock().await;

        if self.manager.current_epoch(&task_id) != Some(session.epoch) {
            return Ok(());
        }
        let Some(task) = self.store.get(&task_id)? else {
            // Orphaned session for a deleted task; just reclaim the slot.
            self.manager.stop(&task_id).await?;
            self.spawn_queue_advance();
            return Ok(());
        };

        match verdict {
            WatchdogVerdict::Died => {
                warn!(task_id = %task_id, epoch = session.epoch, "session process died");
                self.fail_task(&task_id, "session process died").await
            }
            WatchdogVerdict::IdleLockup => match self.progress.progress(&task.full_doc_path()) {
                Ok(p) if p.is_complete() => {
                    info!(task_id = %task_id, "idle with all checkboxes done");
                    self.complete_work(&task).await?;
                    Ok(())
                }
                Ok(p) => {
                    warn!(
                        task_id = %task_id,
                        progress = %p.summary(),
                        "session idle with unfinished work"
                    );
                    let reason = WardenError::IdleLockup {
                        checked: p.checked,
                        total: p.total,
                    }
                    .to_string();
                    self.fail_task(&task_id, &reason).await
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "idle session and unreadable document");
                    self.fail_task(&task_id, &format!("idle with unreadable document: {e}"))
                        .await
                }
            },
        }
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events_rx.recv() => match event {
                    None => break,
                    Some(event) => self.handle_session_event(event).await,
                }
            }
        }
        debug!("event loop exited");
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        if self.manager.current_epoch(&event.task_id) != Some(event.epoch) {
            debug!(task_id = %event.task_id, epoch = event.epoch, "stale session event dropped");
            return;
        }
        match event.kind {
            SessionEventKind::ContextObserved(_) => self.publish(),
            SessionEventKind::ContextExhausted => {
                if let Err(e) = self.restart_for_context(&event).await {
                    warn!(task_id = %event.task_id, error = %e, "context restart failed");
                }
            }
        }
    }

    /// Context exhaustion advised by the monitor: same adapters, same
    /// slot, fresh session with the resume prompt.
    async fn restart_for_context(&self, event: &SessionEvent) -> Result<()> {
        let lock = self.task_lock(&event.task_id);
        let _guard = lock.lock().await;

        if self.manager.current_epoch(&event.task_id) != Some(event.epoch) {
            return Ok(());
        }
        let task = self.load_task(&event.task_id)?;
        if !task.status.has_session() {
            return Ok(());
        }

        info!(task_id = %task.id, "restarting session on low context");
        self.respawn_or_fail(&task, None, RespawnPrompt::Resume)
            .await?;
        Ok(())
    }

    // ---- shared transition helpers ---------------------------------------

    /// Completion of the *work* (all checkboxes done): either hands the
    /// task to the review CLI or finishes it, depending on the effective
    /// review flag.
    async fn complete_work(&self, task: &Task) -> Result<NotifyOutcome> {
        let config = self.config.snapshot();
        match task.status {
            TaskStatus::InProgress => {
                if task.review.resolve(config.review.enabled) {
                    let executing = self
                        .manager
                        .session(&task.id)
                        .map(|s| s.cli.kind())
                        .unwrap_or(config.cli.default);
                    let review_kind = effective_review_cli(executing, &config);
                    let prompt =
                        self.render_for(task, TemplateKind::Review, Some(review_kind))?;

                    self.transition(&task.id, TaskStatus::InReviewing, None)?;
                    info!(
                        task_id = %task.id,
                        executing = %executing,
                        reviewer = %review_kind,
                        "work complete, starting cross-review"
                    );
                    self.respawn_or_fail(task, Some(review_kind), RespawnPrompt::Text(prompt))
                        .await?;
                    Ok(NotifyOutcome::ReviewStarted)
                } else {
                    self.finish_task(&task.id).await?;
                    Ok(NotifyOutcome::TaskCompleted)
                }
            }
            TaskStatus::InReviewing => {
                self.finish_task(&task.id).await?;
                Ok(NotifyOutcome::TaskCompleted)
            }
            _ => Ok(NotifyOutcome::Ignored),
        }
    }

    async fn finish_task(&self, task_id: &str) -> Result<()> {
        self.manager.stop(task_id).await?;
        self.transition(task_id, TaskStatus::Completed, None)?;
        info!(task_id, "task completed");
        self.publish();
        self.spawn_queue_advance();
        Ok(())
    }

    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<()> {
        self.manager.stop(task_id).await?;
        self.transition(task_id, TaskStatus::Failed, Some(reason))?;
        self.publish();
        self.spawn_queue_advance();
        Ok(())
    }

    /// Respawn, and if the replacement session cannot come up, fail the
    /// task: the old session is gone, so leaving the task live would
    /// violate the one-session-per-live-task invariant.
    async fn respawn_or_fail(
        &self,
        task: &Task,
        cli_kind: Option<CliKind>,
        prompt: RespawnPrompt,
    ) -> Result<StartOutcome> {
        match self.manager.respawn(task, cli_kind, prompt).await {
            Ok(outcome) => {
                self.publish();
                Ok(outcome)
            }
            Err(e) => {
                let reason = format!("failed to respawn session: {e}");
                self.transition(&task.id, TaskStatus::Failed, Some(&reason))?;
                self.publish();
                self.spawn_queue_advance();
                Err(e)
            }
        }
    }

    async fn launch_initial(&self, task: &Task) -> Result<StartOutcome> {
        let config = self.config.snapshot();
        let cli_kind = task.cli_kind.unwrap_or(config.cli.default);
        let prompt = self.render_for(task, TemplateKind::InitialTask, Some(cli_kind))?;

        match self.manager.start(task, cli_kind, &prompt).await? {
            StartOutcome::Started => {
                self.transition(&task.id, TaskStatus::InProgress, None)?;
                info!(task_id = %task.id, cli = %cli_kind, "task started");
                self.publish();
                Ok(StartOutcome::Started)
            }
            StartOutcome::Queued => {
                self.publish();
                Ok(StartOutcome::Queued)
            }
        }
    }

    // ---- queue advancement ------------------------------------------------

    fn spawn_queue_advance(&self) {
        if let Some(warden) = self.me.upgrade() {
            tokio::spawn(async move { warden.advance_queue().await });
        }
    }

    /// Starts queued tasks while slots are free, oldest first. A queued
    /// task that fails to spawn is skipped (left pending), never re-queued
    /// in front of younger tasks.
    async fn advance_queue(&self) {
        loop {
            if self.manager.available_slots() == 0 {
                return;
            }
            let Some(next) = self.manager.take_next_queued() else {
                return;
            };
            let lock = self.task_lock(&next);
            let Ok(_guard) = lock.try_lock() else {
                // Another operation owns this task right now; it will
                // advance the queue when it settles.
                self.manager.requeue_front(next);
                return;
            };

            if let Err(e) = self.start_queued(&next).await {
                // A pending task stays pending, same policy as a
                // synchronous start; a resumed task was already failed by
                // the respawn path.
                warn!(task_id = %next, error = %e, "queued task failed to start");
                self.publish();
            }
        }
    }

    async fn start_queued(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.store.get(task_id)? else {
            return Ok(());
        };
        match task.status {
            TaskStatus::Pending => {
                self.launch_initial(&task).await?;
            }
            // A paused task waiting for a slot resumes in place.
            TaskStatus::InProgress | TaskStatus::InReviewing => {
                let prompt = if task.status == TaskStatus::InReviewing {
                    RespawnPrompt::Text(self.render_for(&task, TemplateKind::Review, None)?)
                } else {
                    RespawnPrompt::Resume
                };
                self.respawn_or_fail(&task, None, prompt).await?;
            }
            _ => {}
        }
        Ok(())
    }

    // ---- small helpers ----------------------------------------------------

    /// Single gate for status writes: rejects anything outside the legal
    /// transition graph. Writing the current status again is a no-op, which
    /// is how duplicate verdicts for one session coalesce.
    fn transition(&self, task_id: &str, to: TaskStatus, reason: Option<&str>) -> Result<()> {
        let from = self.load_task(task_id)?.status;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(WardenError::InvalidTransition { from, to });
        }
        self.store.set_status(task_id, to, reason)
    }

    fn task_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(task_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn load_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get(task_id)?
            .ok_or_else(|| WardenError::TaskNotFound(task_id.to_string()))
    }

    fn expect_reviewing(&self, task: &Task) -> Result<()> {
        if task.status == TaskStatus::InReviewing {
            Ok(())
        } else {
            Err(WardenError::InvalidState {
                task_id: task.id.clone(),
                status: task.status,
                expected: "in_reviewing",
            })
        }
    }

    fn render_for(
        &self,
        task: &Task,
        kind: TemplateKind,
        cli_kind: Option<CliKind>,
    ) -> Result<String> {
        let config = self.config.snapshot();
        let cli = cli_kind
            .or(task.cli_kind)
            .unwrap_or(config.cli.default);
        let vars = TemplateVars::for_task(
            task,
            cli.as_str(),
            task.review.resolve(config.review.enabled),
            &config.callback_base_url,
        );
        self.templates.snapshot().render(kind, &vars)
    }

    fn current_snapshot(&self) -> StatusSnapshot {
        let sessions = self.manager.sessions_snapshot();
        let views = sessions
            .iter()
            .map(|session| {
                let status = self
                    .store
                    .get(&session.task_id)
                    .ok()
                    .flatten()
                    .map(|t| t.status)
                    .unwrap_or(TaskStatus::InProgress);
                session.view(status)
            })
            .collect();
        StatusSnapshot {
            sessions: views,
            active: self.manager.active_count(),
            max_concurrent: self.manager.max_concurrent(),
            available_slots: self.manager.available_slots(),
            queued: self.manager.queued(),
            published_at: Utc::now(),
        }
    }

    fn publish(&self) {
        self.broadcaster.publish(self.current_snapshot());
    }
}

fn effective_review_cli(executing: CliKind, config: &WardenConfig) -> CliKind {
    if config.review.cli != executing {
        config.review.cli
    } else {
        CliKind::ALL
            .into_iter()
            .find(|kind| *kind != executing)
            .unwrap_or(executing)
    }
}
