//! Session pool: admission control, spawn/stop lifecycle, slot and queue
//! bookkeeping. The manager owns every `Session` and both adapter handles;
//! nothing else mutates them. The registry lock is only ever held for
//! map/counter operations, never across process or terminal I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::monitor;
use super::{RunPhase, Session, SessionEvent};
use crate::cli::{CliAdapter, CliKind};
use crate::config::ConfigHandle;
use crate::error::{Result, WardenError};
use crate::task::Task;
use crate::terminal::TerminalAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// No free slot; the task holds a FIFO place instead.
    Queued,
}

/// What a respawned session is told on boot.
pub enum RespawnPrompt {
    /// The CLI adapter's mid-task resume instruction.
    Resume,
    Text(String),
}

struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Number of sessions in `RunPhase::Running`; always `<= max_concurrent`.
    active: usize,
    waiting: VecDeque<String>,
}

pub struct SessionManager {
    config: ConfigHandle,
    registry: Mutex<Registry>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    epochs: AtomicU64,
}

impl SessionManager {
    pub fn new(config: ConfigHandle, events_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                active: 0,
                waiting: VecDeque::new(),
            }),
            events_tx,
            epochs: AtomicU64::new(0),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.snapshot().session.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().active
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrent().saturating_sub(self.active_count())
    }

    pub fn session(&self, task_id: &str) -> Option<Arc<Session>> {
        self.registry.lock().sessions.get(task_id).cloned()
    }

    pub fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.registry.lock().sessions.values().cloned().collect()
    }

    pub fn queued(&self) -> Vec<String> {
        self.registry.lock().waiting.iter().cloned().collect()
    }

    pub fn current_epoch(&self, task_id: &str) -> Option<u64> {
        self.session(task_id).map(|s| s.epoch)
    }

    /// Admits the task or queues it. On admission this runs the whole
    /// spawn transaction; any failure rolls back so neither a session nor
    /// a slot is left behind.
    pub async fn start(
        &self,
        task: &Task,
        cli_kind: CliKind,
        prompt: &str,
    ) -> Result<StartOutcome> {
        {
            let mut registry = self.registry.lock();
            if let Some(existing) = registry.sessions.get(&task.id) {
                return Err(WardenError::InvalidState {
                    task_id: task.id.clone(),
                    status: crate::task::TaskStatus::InProgress,
                    expected: match existing.phase() {
                        RunPhase::Paused => "no session (task is paused; restart it instead)",
                        _ => "no session",
                    },
                });
            }
            let max = self.config.snapshot().session.max_concurrent;
            if registry.active >= max {
                if !registry.waiting.contains(&task.id) {
                    registry.waiting.push_back(task.id.clone());
                }
                info!(task_id = %task.id, "pool full, task queued");
                return Ok(StartOutcome::Queued);
            }
            // Reserve the slot before any suspension point so concurrent
            // starts cannot oversubscribe the pool.
            registry.active += 1;
        }

        match self.spawn_session(task, cli_kind, prompt).await {
            Ok(session) => {
                self.register(session);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                self.registry.lock().active -= 1;
                Err(e)
            }
        }
    }

    /// Tears the session down and replaces it in place with a fresh one.
    /// A running session keeps its slot; a paused one has to win a slot
    /// back and may end up queued instead.
    pub async fn respawn(
        &self,
        task: &Task,
        cli_kind: Option<CliKind>,
        prompt: RespawnPrompt,
    ) -> Result<StartOutcome> {
        let old = self
            .session(&task.id)
            .ok_or_else(|| WardenError::SessionNotFound(task.id.clone()))?;

        {
            let mut registry = self.registry.lock();
            match old.phase() {
                RunPhase::Running => {}
                RunPhase::Paused => {
                    let max = self.config.snapshot().session.max_concurrent;
                    if registry.active >= max {
                        if !registry.waiting.contains(&task.id) {
                            registry.waiting.push_back(task.id.clone());
                        }
                        return Ok(StartOutcome::Queued);
                    }
                    registry.active += 1;
                }
                RunPhase::Stopping => {
                    return Err(WardenError::SessionNotFound(task.id.clone()));
                }
            }
            old.set_phase(RunPhase::Stopping);
        }

        self.close_with_grace(&old).await;

        let prompt_text = match prompt {
            RespawnPrompt::Resume => old.cli.resume_prompt(task),
            RespawnPrompt::Text(text) => text,
        };
        let kind = cli_kind.unwrap_or_else(|| old.cli.kind());

        match self.spawn_session(task, kind, &prompt_text).await {
            Ok(session) => {
                info!(
                    task_id = %task.id,
                    old_epoch = old.epoch,
                    new_epoch = session.epoch,
                    cli = %session.cli.kind(),
                    "session respawned"
                );
                self.register(session);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                // The old session is gone and the new one never came up:
                // release the slot and drop the registration entirely.
                let mut registry = self.registry.lock();
                registry.sessions.remove(&task.id);
                registry.active -= 1;
                Err(e)
            }
        }
    }

    async fn spawn_session(
        &self,
        task: &Task,
        cli_kind: CliKind,
        prompt: &str,
    ) -> Result<Arc<Session>> {
        let config = self.config.snapshot();

        let cli = CliAdapter::resolve(cli_kind, config.cli.override_for(cli_kind))?;
        let terminal = TerminalAdapter::resolve(config.terminal)?;

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let scratch_dir = config.scratch_dir();
        tokio::fs::create_dir_all(&scratch_dir).await?;
        let prompt_file = scratch_dir.join(format!("task-{}-{}.md", task.id, epoch));
        tokio::fs::write(&prompt_file, prompt).await?;

        let argv = cli.launch_command(&task.project_dir, &prompt_file, config.session.dangerous);
        let spawn_timeout = Duration::from_secs(config.session.spawn_timeout_secs);

        let handle = tokio::time::timeout(spawn_timeout, terminal.spawn(&task.project_dir, &argv))
            .await
            .map_err(|_| WardenError::SpawnTimeout(config.session.spawn_timeout_secs))??;

        let session = Arc::new(Session::new(
            task.id.clone(),
            epoch,
            cli,
            terminal,
            handle,
        ));
        info!(
            task_id = %task.id,
            epoch,
            cli = %session.cli.kind(),
            terminal = %session.terminal.kind(),
            pid = session.handle.pid,
            "session spawned"
        );
        Ok(session)
    }

    fn register(&self, session: Arc<Session>) {
        tokio::spawn(monitor::run(
            Arc::clone(&session),
            self.events_tx.clone(),
            self.config.clone(),
        ));
        self.registry
            .lock()
            .sessions
            .insert(session.task_id.clone(), session);
    }

    /// Stops and removes the task's session. Returns `false` when there
    /// was none; stopping nothing is not an error.
    pub async fn stop(&self, task_id: &str) -> Result<bool> {
        let session = {
            let mut registry = self.registry.lock();
            let Some(session) = registry.sessions.get(task_id).cloned() else {
                return Ok(false);
            };
            match session.phase() {
                RunPhase::Running => registry.active -= 1,
                RunPhase::Paused => {}
                // Another stop is already tearing this session down.
                RunPhase::Stopping => return Ok(true),
            }
            session.set_phase(RunPhase::Stopping);
            session
        };

        self.close_with_grace(&session).await;
        self.registry.lock().sessions.remove(task_id);
        info!(task_id, epoch = session.epoch, "session stopped");
        Ok(true)
    }

    /// Soft stop: the window closes and the slot frees, but the session
    /// record stays so the task can be resumed later without losing its
    /// adapter assignment.
    pub async fn pause(&self, task_id: &str) -> Result<bool> {
        let session = {
            let mut registry = self.registry.lock();
            let Some(session) = registry.sessions.get(task_id).cloned() else {
                return Ok(false);
            };
            match session.phase() {
                RunPhase::Running => registry.active -= 1,
                RunPhase::Paused => return Ok(true),
                RunPhase::Stopping => return Ok(false),
            }
            session.set_phase(RunPhase::Paused);
            session
        };

        self.close_with_grace(&session).await;
        info!(task_id, epoch = session.epoch, "session paused");
        Ok(true)
    }

    pub async fn stop_all(&self) -> Vec<(String, WardenError)> {
        let task_ids: Vec<String> = {
            let registry = self.registry.lock();
            registry.sessions.keys().cloned().collect()
        };
        self.registry.lock().waiting.clear();

        let mut failures = Vec::new();
        for task_id in task_ids {
            if let Err(e) = self.stop(&task_id).await {
                warn!(task_id = %task_id, error = %e, "failed to stop session");
                failures.push((task_id, e));
            }
        }
        failures
    }

    pub fn take_next_queued(&self) -> Option<String> {
        self.registry.lock().waiting.pop_front()
    }

    pub fn requeue_front(&self, task_id: String) {
        let mut registry = self.registry.lock();
        if !registry.waiting.contains(&task_id) {
            registry.waiting.push_front(task_id);
        }
    }

    pub fn remove_waiting(&self, task_id: &str) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.waiting.len();
        registry.waiting.retain(|id| id != task_id);
        registry.waiting.len() != before
    }

    async fn close_with_grace(&self, session: &Session) {
        let grace = Duration::from_secs(self.config.snapshot().session.stop_grace_secs);
        if tokio::time::timeout(grace, session.terminal.close(&session.handle))
            .await
            .is_err()
        {
            debug!(
                task_id = %session.task_id,
                "terminal close did not confirm within grace window"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverride, WardenConfig};
    use crate::terminal::TerminalChoice;

    /// A pool wired to the headless terminal, with every CLI resolving to
    /// a long-sleeping shell so spawns are real processes.
    fn test_manager(max_concurrent: usize) -> (Arc<SessionManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WardenConfig::default();
        config.session.max_concurrent = max_concurrent;
        config.session.dangerous = false;
        config.terminal = TerminalChoice::Headless;
        config.scratch_dir = Some(dir.path().join("scratch"));
        for kind in CliKind::ALL {
            config.cli.overrides.insert(
                kind.as_str().to_string(),
                CliOverride {
                    command: Some("sh".into()),
                    extra_args: vec!["-c".into(), "sleep 300".into()],
                },
            );
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Monitors run against real sessions; drain their events.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        (
            Arc::new(SessionManager::new(ConfigHandle::new(config), tx)),
            dir,
        )
    }

    fn test_task(dir: &tempfile::TempDir, name: &str) -> Task {
        let project = dir.path().join(name);
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("plan.md"), "- [ ] one\n").unwrap();
        Task::new(project, "plan.md")
    }

    #[tokio::test]
    async fn test_admission_and_fifo_queueing() {
        let (manager, dir) = test_manager(2);
        let t1 = test_task(&dir, "p1");
        let t2 = test_task(&dir, "p2");
        let t3 = test_task(&dir, "p3");

        for (task, expected) in [
            (&t1, StartOutcome::Started),
            (&t2, StartOutcome::Started),
            (&t3, StartOutcome::Queued),
        ] {
            let outcome = manager
                .start(task, CliKind::ClaudeCode, "prompt")
                .await
                .unwrap();
            assert_eq!(outcome, expected);
        }

        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.queued(), vec![t3.id.clone()]);

        // Queueing the same task twice holds one place.
        assert_eq!(
            manager
                .start(&t3, CliKind::ClaudeCode, "prompt")
                .await
                .unwrap(),
            StartOutcome::Queued
        );
        assert_eq!(manager.queued().len(), 1);

        manager.stop_all().await;
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_rolls_back_slot() {
        let (manager, dir) = test_manager(1);
        let task = test_task(&dir, "p1");

        // Unresolvable CLI: the error surfaces and no slot is consumed.
        manager
            .config
            .update(|c| {
                c.cli.overrides.insert(
                    CliKind::Gemini.as_str().to_string(),
                    CliOverride {
                        command: Some("/no/such/cli".into()),
                        extra_args: vec![],
                    },
                );
            })
            .unwrap();

        let err = manager
            .start(&task, CliKind::Gemini, "prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::CliUnavailable(_)));
        assert_eq!(manager.active_count(), 0);
        assert!(manager.session(&task.id).is_none());

        // The slot is still usable afterwards.
        assert_eq!(
            manager
                .start(&task, CliKind::ClaudeCode, "prompt")
                .await
                .unwrap(),
            StartOutcome::Started
        );
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_double_start_is_invalid() {
        let (manager, dir) = test_manager(2);
        let task = test_task(&dir, "p1");

        manager
            .start(&task, CliKind::ClaudeCode, "prompt")
            .await
            .unwrap();
        let err = manager
            .start(&task, CliKind::ClaudeCode, "prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidState { .. }));
        assert_eq!(manager.active_count(), 1);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let (manager, _dir) = test_manager(1);
        assert!(!manager.stop("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_respawn_keeps_slot_and_bumps_epoch() {
        let (manager, dir) = test_manager(1);
        let task = test_task(&dir, "p1");

        manager
            .start(&task, CliKind::ClaudeCode, "prompt")
            .await
            .unwrap();
        let first_epoch = manager.current_epoch(&task.id).unwrap();
        let first_pid = manager.session(&task.id).unwrap().handle.pid;

        let outcome = manager
            .respawn(&task, None, RespawnPrompt::Resume)
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::Started);

        let session = manager.session(&task.id).unwrap();
        assert!(session.epoch > first_epoch);
        assert_ne!(session.handle.pid, first_pid);
        assert_eq!(session.cli.kind(), CliKind::ClaudeCode);
        assert_eq!(manager.active_count(), 1);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_respawn_can_switch_cli() {
        let (manager, dir) = test_manager(1);
        let task = test_task(&dir, "p1");

        manager
            .start(&task, CliKind::ClaudeCode, "prompt")
            .await
            .unwrap();
        manager
            .respawn(&task, Some(CliKind::Codex), RespawnPrompt::Text("review".into()))
            .await
            .unwrap();

        assert_eq!(
            manager.session(&task.id).unwrap().cli.kind(),
            CliKind::Codex
        );
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_pause_frees_slot_but_keeps_record() {
        let (manager, dir) = test_manager(1);
        let t1 = test_task(&dir, "p1");
        let t2 = test_task(&dir, "p2");

        manager.start(&t1, CliKind::ClaudeCode, "prompt").await.unwrap();
        assert!(manager.pause(&t1.id).await.unwrap());
        assert_eq!(manager.active_count(), 0);
        assert_eq!(
            manager.session(&t1.id).unwrap().phase(),
            RunPhase::Paused
        );

        // The freed slot admits another task.
        assert_eq!(
            manager.start(&t2, CliKind::ClaudeCode, "prompt").await.unwrap(),
            StartOutcome::Started
        );

        // Resuming the paused task now queues it.
        assert_eq!(
            manager
                .respawn(&t1, None, RespawnPrompt::Resume)
                .await
                .unwrap(),
            StartOutcome::Queued
        );
        assert_eq!(manager.queued(), vec![t1.id.clone()]);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_releases_slot_for_queue() {
        let (manager, dir) = test_manager(1);
        let t1 = test_task(&dir, "p1");
        let t2 = test_task(&dir, "p2");

        manager.start(&t1, CliKind::ClaudeCode, "prompt").await.unwrap();
        manager.start(&t2, CliKind::ClaudeCode, "prompt").await.unwrap();
        assert_eq!(manager.queued(), vec![t2.id.clone()]);

        manager.stop(&t1.id).await.unwrap();
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.take_next_queued(), Some(t2.id.clone()));
        assert_eq!(manager.take_next_queued(), None);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_clears_queue_and_reports_no_failures() {
        let (manager, dir) = test_manager(1);
        let t1 = test_task(&dir, "p1");
        let t2 = test_task(&dir, "p2");

        manager.start(&t1, CliKind::ClaudeCode, "prompt").await.unwrap();
        manager.start(&t2, CliKind::ClaudeCode, "prompt").await.unwrap();

        let failures = manager.stop_all().await;
        assert!(failures.is_empty());
        assert_eq!(manager.active_count(), 0);
        assert!(manager.queued().is_empty());

        // Idempotent.
        assert!(manager.stop_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_prompt_written_to_scratch_file() {
        let (manager, dir) = test_manager(1);
        let task = test_task(&dir, "p1");

        manager
            .start(&task, CliKind::ClaudeCode, "the rendered prompt body")
            .await
            .unwrap();

        let epoch = manager.current_epoch(&task.id).unwrap();
        let prompt_file = dir
            .path()
            .join("scratch")
            .join(format!("task-{}-{}.md", task.id, epoch));
        let content = std::fs::read_to_string(prompt_file).unwrap();
        assert_eq!(content, "the rendered prompt body");
        manager.stop_all().await;
    }
}
