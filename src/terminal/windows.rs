//! Windows Terminal adapter. `wt.exe` detaches immediately and exposes no
//! window or process identifiers, so liveness is always `Unknown` and the
//! watchdog falls back to heartbeats for these sessions.

use std::path::Path;

use tokio::process::Command;

use super::{Liveness, WindowHandle, find_in_path};
use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Default)]
pub struct WtTerminal;

impl WtTerminal {
    pub fn new() -> Self {
        Self
    }

    pub fn is_available(&self) -> bool {
        cfg!(target_os = "windows") && find_in_path("wt.exe").is_some()
    }

    pub async fn spawn(&self, directory: &Path, argv: &[String]) -> Result<WindowHandle> {
        let status = Command::new("wt.exe")
            .arg("-d")
            .arg(directory)
            .args(argv)
            .status()
            .await
            .map_err(|e| WardenError::SpawnFailed(format!("wt.exe: {e}")))?;

        if !status.success() {
            return Err(WardenError::SpawnFailed(format!(
                "wt.exe exited with {status}"
            )));
        }

        // wt.exe hands the window to an existing terminal process and
        // returns; there is nothing to hold on to.
        Ok(WindowHandle::default())
    }

    pub async fn is_alive(&self, _handle: &WindowHandle) -> Liveness {
        Liveness::Unknown
    }

    pub async fn close(&self, _handle: &WindowHandle) {
        // No handle, nothing to close. The watchdog's heartbeat timeout is
        // the only way these sessions are reclaimed.
    }
}
