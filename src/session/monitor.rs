//! Per-session monitor.
//!
//! Each running session gets one of these. It owns the session's output
//! stream: polls the terminal, feeds context readings through the
//! tracker, maintains the idle/activity timestamps, and publishes events
//! to the orchestrator over its channel. It never transitions task state
//! itself.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Session, SessionEvent, SessionEventKind};
use crate::config::ConfigHandle;

/// Lines of tail inspected for the idle signature.
const IDLE_TAIL_LINES: usize = 12;

pub(crate) async fn run(
    session: Arc<Session>,
    events: mpsc::UnboundedSender<SessionEvent>,
    config: ConfigHandle,
) {
    let mut stop = session.stop_signal();
    let mut last_digest: Option<u64> = None;
    debug!(task_id = %session.task_id, epoch = session.epoch, "session monitor started");

    loop {
        let poll = Duration::from_secs(config.snapshot().context.poll_interval_secs);
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll) => {}
        }
        if !session.is_running() {
            break;
        }

        if let Some(output) = session.terminal.capture_output(&session.handle).await {
            let digest = digest_of(&output);
            if last_digest != Some(digest) {
                session.mark_activity();
                last_digest = Some(digest);
            }

            let tail = tail_of(&output, IDLE_TAIL_LINES);
            if session.cli.idle_signature(&tail) {
                session.note_idle();
            } else {
                session.note_busy();
            }

            if let Some(percent) = session.cli.parse_context_remaining(&output)
                && let Some(accepted) = session.observe_context(percent)
            {
                send(&events, &session, SessionEventKind::ContextObserved(accepted));
            }
        }

        // Callbacks can also feed the tracker, so the threshold check runs
        // every tick even when the terminal offers no output capture.
        if session.should_restart(&config.snapshot().context) && session.claim_restart() {
            debug!(
                task_id = %session.task_id,
                remaining = session.context_remaining(),
                "context threshold crossed, advising restart"
            );
            send(&events, &session, SessionEventKind::ContextExhausted);
        }
    }

    debug!(task_id = %session.task_id, epoch = session.epoch, "session monitor exited");
}

fn send(
    events: &mpsc::UnboundedSender<SessionEvent>,
    session: &Session,
    kind: SessionEventKind,
) {
    let event = SessionEvent {
        task_id: session.task_id.clone(),
        epoch: session.epoch,
        kind,
    };
    if events.send(event).is_err() {
        warn!(task_id = %session.task_id, "event channel closed, dropping session event");
    }
}

fn digest_of(output: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    output.hash(&mut hasher);
    hasher.finish()
}

fn tail_of(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
