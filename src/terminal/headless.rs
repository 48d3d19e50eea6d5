//! Headless runner: executes the CLI as a direct child process with piped
//! output. Used on hosts without a GUI and by the integration tests. The
//! trade-off versus a real emulator is that the CLI gets a pipe, not a
//! tty, so interactive rendering may differ.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Liveness, WindowHandle, pid_alive};
use crate::error::{Result, WardenError};

const OUTPUT_RING_LINES: usize = 200;

/// Shared view of a headless child's recent output and exit state.
#[derive(Clone)]
pub struct HeadlessProcess {
    exited: Arc<AtomicBool>,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl std::fmt::Debug for HeadlessProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessProcess")
            .field("exited", &self.exited.load(Ordering::Relaxed))
            .finish()
    }
}

impl HeadlessProcess {
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Relaxed)
    }

    pub fn tail(&self) -> String {
        let lines = self.output.lock();
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn push_line(&self, line: String) {
        let mut lines = self.output.lock();
        if lines.len() >= OUTPUT_RING_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeadlessTerminal;

impl HeadlessTerminal {
    pub fn new() -> Self {
        Self
    }

    pub fn is_available(&self) -> bool {
        true
    }

    pub async fn spawn(&self, directory: &Path, argv: &[String]) -> Result<WindowHandle> {
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| WardenError::SpawnFailed(format!("{}: {e}", argv[0])))?;

        let pid = child
            .id()
            .ok_or_else(|| WardenError::SpawnFailed("child exited before start".to_string()))?;

        let process = HeadlessProcess {
            exited: Arc::new(AtomicBool::new(false)),
            output: Arc::new(Mutex::new(VecDeque::new())),
        };

        if let Some(stdout) = child.stdout.take() {
            let sink = process.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.push_line(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = process.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.push_line(line);
                }
            });
        }

        // Reap the child so it never lingers as a zombie.
        let exited = Arc::clone(&process.exited);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, %status, "headless process exited"),
                Err(e) => warn!(pid, error = %e, "failed to wait on headless process"),
            }
            exited.store(true, Ordering::Relaxed);
        });

        Ok(WindowHandle {
            pid: Some(pid),
            process: Some(process),
            ..WindowHandle::default()
        })
    }

    pub async fn is_alive(&self, handle: &WindowHandle) -> Liveness {
        match &handle.process {
            Some(p) if p.has_exited() => Liveness::Dead,
            Some(_) => Liveness::Alive,
            None => match handle.pid {
                Some(pid) if pid_alive(pid) => Liveness::Alive,
                Some(_) => Liveness::Dead,
                None => Liveness::Unknown,
            },
        }
    }

    pub async fn close(&self, handle: &WindowHandle) {
        let Some(pid) = handle.pid else { return };
        if handle.process.as_ref().is_some_and(|p| p.has_exited()) {
            return;
        }
        terminate(pid);
    }

    pub async fn capture_output(&self, handle: &WindowHandle) -> Option<String> {
        handle.process.as_ref().map(|p| p.tail())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}
