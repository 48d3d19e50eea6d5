//! End-to-end flows through the orchestration core: admission, completion,
//! context restarts, watchdog recovery, and cross-review. Sessions run as
//! real headless processes (plain `sh` standing in for the CLIs).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskwarden::cli::CliKind;
use taskwarden::config::{CliOverride, WardenConfig};
use taskwarden::orchestrator::{NotifyOutcome, ReportedStatus, StatusReport, Warden};
use taskwarden::session::StartOutcome;
use taskwarden::task::{MemoryTaskStore, ReviewMode, Task, TaskStatus, TaskStore};
use taskwarden::terminal::TerminalChoice;

struct Fixture {
    warden: Arc<Warden>,
    store: Arc<MemoryTaskStore>,
    dir: tempfile::TempDir,
}

/// A pool on the headless terminal where every CLI is `sh` running a long
/// sleep. Watchdog and monitor intervals are tightened so recovery paths
/// land within a few seconds.
async fn fixture(mutate: impl FnOnce(&mut WardenConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = WardenConfig::default();
    config.session.max_concurrent = 3;
    config.session.dangerous = false;
    config.terminal = TerminalChoice::Headless;
    config.scratch_dir = Some(dir.path().join("scratch"));
    config.watchdog.check_interval_secs = 1;
    config.context.poll_interval_secs = 1;
    config.context.min_run_secs = 0;
    for kind in CliKind::ALL {
        config.cli.overrides.insert(
            kind.as_str().to_string(),
            CliOverride {
                command: Some("sh".into()),
                extra_args: vec!["-c".into(), "sleep 300".into()],
            },
        );
    }
    mutate(&mut config);

    let store = Arc::new(MemoryTaskStore::new());
    let warden = Warden::new(config, Arc::clone(&store) as Arc<dyn TaskStore>).unwrap();
    warden.start().await.unwrap();
    Fixture { warden, store, dir }
}

impl Fixture {
    fn make_task(&self, name: &str, doc: &str) -> Task {
        let project = self.dir.path().join(name);
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("plan.md"), doc).unwrap();
        let task = Task::new(project, PathBuf::from("plan.md"));
        self.store.create(&task).unwrap();
        task
    }

    fn status_of(&self, task_id: &str) -> TaskStatus {
        self.store.get(task_id).unwrap().unwrap().status
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool, secs: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_happy_path_without_review() {
    let fx = fixture(|c| c.review.enabled = false).await;
    let mut sub = fx.warden.subscribe();
    let task = fx.make_task("p1", "- [x] build it\n- [x] test it\n");

    let outcome = fx.warden.start_task(&task.id).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    assert_eq!(fx.status_of(&task.id), TaskStatus::InProgress);
    assert_eq!(fx.warden.manager().active_count(), 1);

    let outcome = fx
        .warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::Completed))
        .await
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::TaskCompleted);
    assert_eq!(fx.status_of(&task.id), TaskStatus::Completed);
    assert_eq!(fx.warden.manager().active_count(), 0);

    // Subscribers saw the task appear in progress and then leave the pool,
    // in publish order.
    let mut saw_in_progress = false;
    let mut saw_gone_after = false;
    let mut last_published = None;
    while let Some(snapshot) = sub.try_recv() {
        if let Some(previous) = last_published {
            assert!(snapshot.published_at >= previous);
        }
        last_published = Some(snapshot.published_at);

        let has_t1 = snapshot.sessions.iter().any(|s| s.task_id == task.id);
        if has_t1 && snapshot.sessions[0].status == TaskStatus::InProgress {
            saw_in_progress = true;
        }
        if saw_in_progress && !has_t1 {
            saw_gone_after = true;
        }
    }
    assert!(saw_in_progress);
    assert!(saw_gone_after);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_start_requires_pending() {
    let fx = fixture(|_| {}).await;
    let task = fx.make_task("p1", "- [ ] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    let err = fx.warden.start_task(&task.id).await.unwrap_err();
    assert!(err.to_string().contains("expected pending"));

    assert!(fx.warden.start_task("no-such-task").await.is_err());
    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_admission_queue_fifo_and_autostart() {
    let fx = fixture(|c| c.session.max_concurrent = 2).await;
    let t1 = fx.make_task("p1", "- [ ] a\n");
    let t2 = fx.make_task("p2", "- [ ] a\n");
    let t3 = fx.make_task("p3", "- [ ] a\n");

    assert_eq!(
        fx.warden.start_task(&t1.id).await.unwrap(),
        StartOutcome::Started
    );
    assert_eq!(
        fx.warden.start_task(&t2.id).await.unwrap(),
        StartOutcome::Started
    );
    assert_eq!(
        fx.warden.start_task(&t3.id).await.unwrap(),
        StartOutcome::Queued
    );

    // The queued task holds no slot and stays pending.
    assert_eq!(fx.status_of(&t3.id), TaskStatus::Pending);
    assert_eq!(fx.warden.manager().active_count(), 2);
    assert!(fx.warden.manager().active_count() <= fx.warden.manager().max_concurrent());
    assert_eq!(fx.warden.list_sessions().queued, vec![t3.id.clone()]);

    // Freeing a slot starts the queued task without another operator call.
    fx.warden.stop_task(&t1.id).await.unwrap();
    assert_eq!(fx.status_of(&t1.id), TaskStatus::Pending);

    assert!(
        wait_for(|| fx.status_of(&t3.id) == TaskStatus::InProgress, 10).await,
        "queued task never started"
    );
    assert!(fx.warden.manager().session(&t3.id).is_some());
    assert_eq!(fx.warden.manager().active_count(), 2);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_stop_on_queued_task_releases_queue_place() {
    let fx = fixture(|c| c.session.max_concurrent = 1).await;
    let t1 = fx.make_task("p1", "- [ ] a\n");
    let t2 = fx.make_task("p2", "- [ ] a\n");

    fx.warden.start_task(&t1.id).await.unwrap();
    assert_eq!(
        fx.warden.start_task(&t2.id).await.unwrap(),
        StartOutcome::Queued
    );

    // start then stop on a still-pending task leaves it pending and frees
    // its queue place.
    fx.warden.stop_task(&t2.id).await.unwrap();
    assert_eq!(fx.status_of(&t2.id), TaskStatus::Pending);
    assert!(fx.warden.list_sessions().queued.is_empty());

    // Stop with no session at all is a successful no-op.
    fx.warden.stop_task(&t2.id).await.unwrap();
    assert_eq!(fx.status_of(&t2.id), TaskStatus::Pending);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_context_exhaustion_restarts_once() {
    let fx = fixture(|c| c.session.max_concurrent = 1).await;
    let task = fx.make_task("p1", "- [ ] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    let first_epoch = fx.warden.manager().current_epoch(&task.id).unwrap();

    for percent in [45, 20] {
        let mut report = StatusReport::status(ReportedStatus::InProgress);
        report.context_remaining = Some(percent);
        fx.warden.notify_status(&task.id, report).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;
    // Above the threshold: no restart yet.
    assert_eq!(
        fx.warden.manager().current_epoch(&task.id),
        Some(first_epoch)
    );

    let mut report = StatusReport::status(ReportedStatus::InProgress);
    report.context_remaining = Some(10);
    fx.warden.notify_status(&task.id, report).await.unwrap();

    assert!(
        wait_for(
            || fx.warden.manager().current_epoch(&task.id) == Some(first_epoch + 1),
            10
        )
        .await,
        "context restart never happened"
    );

    // Exactly one restart: the replacement session has no readings, the
    // slot never moved, and the task never left in_progress.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        fx.warden.manager().current_epoch(&task.id),
        Some(first_epoch + 1)
    );
    assert_eq!(fx.warden.manager().active_count(), 1);
    assert_eq!(fx.status_of(&task.id), TaskStatus::InProgress);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_process_death_fails_task_and_frees_slot() {
    let fx = fixture(|c| c.session.max_concurrent = 1).await;
    let t1 = fx.make_task("p1", "- [ ] a\n");
    let t2 = fx.make_task("p2", "- [ ] a\n");

    fx.warden.start_task(&t1.id).await.unwrap();
    fx.warden.start_task(&t2.id).await.unwrap();
    let pid = fx.warden.manager().session(&t1.id).unwrap().handle.pid.unwrap();

    // Kill the process behind the orchestrator's back.
    std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();

    assert!(
        wait_for(|| fx.status_of(&t1.id) == TaskStatus::Failed, 15).await,
        "watchdog never detected the death"
    );
    let failed = fx.store.get(&t1.id).unwrap().unwrap();
    assert!(failed.last_error.unwrap().contains("died"));

    // The slot was released and the queued task took it.
    assert!(
        wait_for(|| fx.status_of(&t2.id) == TaskStatus::InProgress, 10).await,
        "slot never reached the queued task"
    );

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_idle_with_complete_document_completes() {
    let fx = fixture(|c| {
        // The stand-in CLI prints Claude Code's idle footer and parks.
        c.cli.overrides.insert(
            CliKind::ClaudeCode.as_str().to_string(),
            CliOverride {
                command: Some("sh".into()),
                extra_args: vec![
                    "-c".into(),
                    "echo '? for shortcuts'; sleep 300".into(),
                ],
            },
        );
    })
    .await;
    let task = fx.make_task("p1", "- [x] a\n- [x] b\n");

    fx.warden.start_task(&task.id).await.unwrap();

    assert!(
        wait_for(|| fx.status_of(&task.id) == TaskStatus::Completed, 15).await,
        "idle session with finished work never completed"
    );
    assert_eq!(fx.warden.manager().active_count(), 0);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_idle_with_unfinished_document_fails() {
    let fx = fixture(|c| {
        c.cli.overrides.insert(
            CliKind::ClaudeCode.as_str().to_string(),
            CliOverride {
                command: Some("sh".into()),
                extra_args: vec![
                    "-c".into(),
                    "echo '? for shortcuts'; sleep 300".into(),
                ],
            },
        );
    })
    .await;
    let task = fx.make_task("p1", "- [x] a\n- [ ] b\n- [ ] c\n");

    fx.warden.start_task(&task.id).await.unwrap();

    assert!(
        wait_for(|| fx.status_of(&task.id) == TaskStatus::Failed, 15).await,
        "idle lockup never detected"
    );
    let failed = fx.store.get(&task.id).unwrap().unwrap();
    assert!(failed.last_error.unwrap().contains("idle"));
    assert_eq!(fx.warden.manager().active_count(), 0);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_completion_claim_with_remaining_work_restarts() {
    let fx = fixture(|_| {}).await;
    let task = fx.make_task("p1", "- [x] a\n- [ ] b\n");

    fx.warden.start_task(&task.id).await.unwrap();
    let first_epoch = fx.warden.manager().current_epoch(&task.id).unwrap();

    let outcome = fx
        .warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::Completed))
        .await
        .unwrap();

    // The document contradicts the claim: fresh session, same task status.
    assert_eq!(outcome, NotifyOutcome::SessionRestarted);
    assert_eq!(fx.status_of(&task.id), TaskStatus::InProgress);
    assert!(fx.warden.manager().current_epoch(&task.id).unwrap() > first_epoch);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_cross_review_handoff_and_stop_semantics() {
    let fx = fixture(|c| {
        c.review.enabled = true;
        c.review.cli = CliKind::Codex;
    })
    .await;
    let task = fx.make_task("p1", "- [x] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    assert_eq!(
        fx.warden.manager().session(&task.id).unwrap().cli.kind(),
        CliKind::ClaudeCode
    );

    let outcome = fx
        .warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::Completed))
        .await
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::ReviewStarted);
    assert_eq!(fx.status_of(&task.id), TaskStatus::InReviewing);

    // The review session runs under a different CLI and holds the slot.
    let session = fx.warden.manager().session(&task.id).unwrap();
    assert_eq!(session.cli.kind(), CliKind::Codex);
    assert_eq!(fx.warden.manager().active_count(), 1);

    // An operator stop during review keeps the completed outcome.
    fx.warden.stop_task(&task.id).await.unwrap();
    assert_eq!(fx.status_of(&task.id), TaskStatus::Completed);
    assert_eq!(fx.warden.manager().active_count(), 0);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_review_completed_callback_finishes_task() {
    let fx = fixture(|c| {
        c.review.enabled = true;
        c.review.cli = CliKind::Codex;
    })
    .await;
    let task = fx.make_task("p1", "- [x] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    fx.warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::Completed))
        .await
        .unwrap();
    assert_eq!(fx.status_of(&task.id), TaskStatus::InReviewing);

    // Review-phase callbacks are rejected outside review, accepted inside.
    let outcome = fx
        .warden
        .notify_status(
            &task.id,
            StatusReport::status(ReportedStatus::ReviewCompleted),
        )
        .await
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::TaskCompleted);
    assert_eq!(fx.status_of(&task.id), TaskStatus::Completed);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_review_callbacks_outside_review_are_errors() {
    let fx = fixture(|_| {}).await;
    let task = fx.make_task("p1", "- [ ] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    let err = fx
        .warden
        .notify_status(
            &task.id,
            StatusReport::status(ReportedStatus::ReviewCompleted),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("in_reviewing"));

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_late_callback_cannot_regress_completed_task() {
    let fx = fixture(|_| {}).await;
    let task = fx.make_task("p1", "- [x] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    fx.warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::Completed))
        .await
        .unwrap();
    assert_eq!(fx.status_of(&task.id), TaskStatus::Completed);

    // A straggler report changes nothing.
    let outcome = fx
        .warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::InProgress))
        .await
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::Ignored);
    assert_eq!(fx.status_of(&task.id), TaskStatus::Completed);
    assert!(fx.warden.manager().session(&task.id).is_none());

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_failed_callback_fails_task() {
    let fx = fixture(|_| {}).await;
    let task = fx.make_task("p1", "- [ ] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    let mut report = StatusReport::status(ReportedStatus::Failed);
    report.error = Some("tests will not pass".to_string());
    let outcome = fx.warden.notify_status(&task.id, report).await.unwrap();

    assert_eq!(outcome, NotifyOutcome::TaskFailed);
    assert_eq!(fx.status_of(&task.id), TaskStatus::Failed);
    assert_eq!(
        fx.store
            .get(&task.id)
            .unwrap()
            .unwrap()
            .last_error
            .as_deref(),
        Some("tests will not pass")
    );
    assert_eq!(fx.warden.manager().active_count(), 0);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_pause_frees_slot_and_restart_resumes() {
    let fx = fixture(|c| c.session.max_concurrent = 1).await;
    let task = fx.make_task("p1", "- [ ] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    fx.warden.pause_task(&task.id).await.unwrap();

    // Status untouched, slot free.
    assert_eq!(fx.status_of(&task.id), TaskStatus::InProgress);
    assert_eq!(fx.warden.manager().active_count(), 0);

    let outcome = fx.warden.restart_task(&task.id).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    assert_eq!(fx.warden.manager().active_count(), 1);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_operator_restart_keeps_slot_and_bumps_epoch() {
    let fx = fixture(|c| c.session.max_concurrent = 1).await;
    let task = fx.make_task("p1", "- [ ] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    let first_epoch = fx.warden.manager().current_epoch(&task.id).unwrap();

    fx.warden.restart_task(&task.id).await.unwrap();
    assert_eq!(
        fx.warden.manager().current_epoch(&task.id),
        Some(first_epoch + 1)
    );
    assert_eq!(fx.warden.manager().active_count(), 1);
    assert_eq!(fx.status_of(&task.id), TaskStatus::InProgress);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_stop_all_is_idempotent() {
    let fx = fixture(|c| c.session.max_concurrent = 2).await;
    let t1 = fx.make_task("p1", "- [ ] a\n");
    let t2 = fx.make_task("p2", "- [ ] a\n");
    let t3 = fx.make_task("p3", "- [ ] a\n");

    for task in [&t1, &t2, &t3] {
        fx.warden.start_task(&task.id).await.unwrap();
    }

    let failures = fx.warden.stop_all().await;
    assert!(failures.is_empty());
    assert_eq!(fx.warden.manager().active_count(), 0);
    assert!(fx.warden.list_sessions().queued.is_empty());
    for task in [&t1, &t2, &t3] {
        assert_eq!(fx.status_of(&task.id), TaskStatus::Pending);
    }

    // Second run has nothing to do and reports nothing.
    assert!(fx.warden.stop_all().await.is_empty());

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_startup_reconciliation_fails_stale_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("p1");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("plan.md"), "- [ ] a\n").unwrap();

    let store = Arc::new(MemoryTaskStore::new());
    let stale = Task::new(project, PathBuf::from("plan.md"));
    store.create(&stale).unwrap();
    store
        .set_status(&stale.id, TaskStatus::InProgress, None)
        .unwrap();

    let mut config = WardenConfig::default();
    config.terminal = TerminalChoice::Headless;
    config.scratch_dir = Some(dir.path().join("scratch"));

    let warden = Warden::new(config, Arc::clone(&store) as Arc<dyn TaskStore>).unwrap();
    warden.start().await.unwrap();

    // No session can be re-adopted across a restart; the task fails with
    // a recovery reason instead of dangling.
    let task = store.get(&stale.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.unwrap().contains("recovery failed"));

    warden.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_leaves_task_pending() {
    let fx = fixture(|c| {
        c.cli.overrides.insert(
            CliKind::ClaudeCode.as_str().to_string(),
            CliOverride {
                command: Some("/no/such/binary".into()),
                extra_args: vec![],
            },
        );
    })
    .await;
    let task = fx.make_task("p1", "- [ ] a\n");

    let err = fx.warden.start_task(&task.id).await.unwrap_err();
    assert!(err.to_string().contains("not installed"));
    assert_eq!(fx.status_of(&task.id), TaskStatus::Pending);
    assert_eq!(fx.warden.manager().active_count(), 0);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_review_session_restart_mid_review() {
    let fx = fixture(|c| {
        c.review.enabled = true;
        c.review.cli = CliKind::Gemini;
    })
    .await;
    let task = fx.make_task("p1", "- [x] a\n");

    fx.warden.start_task(&task.id).await.unwrap();
    fx.warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::Completed))
        .await
        .unwrap();
    let review_epoch = fx.warden.manager().current_epoch(&task.id).unwrap();

    // The reviewer ran out of context; a fresh review session continues.
    let outcome = fx
        .warden
        .notify_status(
            &task.id,
            StatusReport::status(ReportedStatus::ReviewSessionCompleted),
        )
        .await
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::SessionRestarted);
    assert_eq!(fx.status_of(&task.id), TaskStatus::InReviewing);
    let session = fx.warden.manager().session(&task.id).unwrap();
    assert_eq!(session.cli.kind(), CliKind::Gemini);
    assert!(session.epoch > review_epoch);

    fx.warden.shutdown().await;
}

#[tokio::test]
async fn test_per_task_review_override_beats_global() {
    // Review globally on, but this task forces it off.
    let fx = fixture(|c| c.review.enabled = true).await;
    let task = fx.make_task("p1", "- [x] a\n");
    let task = Task {
        review: ReviewMode::Disabled,
        ..task
    };
    // Recreate with the override in place.
    fx.store.create(&task).unwrap();

    fx.warden.start_task(&task.id).await.unwrap();
    let outcome = fx
        .warden
        .notify_status(&task.id, StatusReport::status(ReportedStatus::Completed))
        .await
        .unwrap();

    assert_eq!(outcome, NotifyOutcome::TaskCompleted);
    assert_eq!(fx.status_of(&task.id), TaskStatus::Completed);

    fx.warden.shutdown().await;
}
