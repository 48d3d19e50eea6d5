//! Kitty adapter, driven over its remote-control socket so windows can be
//! queried and closed without ever taking focus.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{Liveness, WindowHandle, pid_alive, shell_join};
use crate::error::{Result, WardenError};

const KITTY_PATHS: &[&str] = &[
    "/Applications/kitty.app/Contents/MacOS/kitty",
    "/usr/local/bin/kitty",
    "/usr/bin/kitty",
];

#[derive(Debug, Clone, Default)]
pub struct KittyTerminal;

impl KittyTerminal {
    pub fn new() -> Self {
        Self
    }

    pub fn is_available(&self) -> bool {
        kitty_path().is_some()
    }

    pub async fn spawn(&self, directory: &Path, argv: &[String]) -> Result<WindowHandle> {
        let kitty = kitty_path()
            .ok_or_else(|| WardenError::SpawnFailed("kitty not installed".to_string()))?;

        let socket_path = std::env::temp_dir().join(format!(
            "taskwarden-kitty-{}",
            &uuid::Uuid::new_v4().to_string()[..8]
        ));

        // Keep the window open after the CLI exits so the operator can read
        // the final screen.
        let command_line = format!("{}; exec sh", shell_join(argv));

        let child = Command::new(&kitty)
            .arg("--listen-on")
            .arg(format!("unix:{}", socket_path.display()))
            .arg("--directory")
            .arg(directory)
            .args(["-o", "allow_remote_control=socket-only"])
            .args(["-e", "sh", "-c", &command_line])
            .spawn()
            .map_err(|e| WardenError::SpawnFailed(format!("kitty: {e}")))?;
        let pid = child.id();

        // The socket appears once kitty is up; give it a couple of seconds.
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            warn!(socket = %socket_path.display(), "kitty control socket never appeared");
        }

        Ok(WindowHandle {
            pid,
            socket_path: Some(socket_path),
            ..WindowHandle::default()
        })
    }

    pub async fn is_alive(&self, handle: &WindowHandle) -> Liveness {
        let Some(socket) = &handle.socket_path else {
            return Liveness::Unknown;
        };
        if !socket.exists() {
            return Liveness::Dead;
        }
        match handle.pid {
            // Stale sockets survive a SIGKILLed kitty; trust the pid.
            Some(pid) if !pid_alive(pid) => Liveness::Dead,
            _ => Liveness::Alive,
        }
    }

    pub async fn close(&self, handle: &WindowHandle) {
        let Some(socket) = &handle.socket_path else {
            return;
        };
        if socket.exists() {
            let result = remote_control(socket, &["close-window"]).await;
            if let Err(e) = result {
                debug!(error = %e, "kitty close-window failed");
            }
            let _ = std::fs::remove_file(socket);
        }
    }

    pub async fn capture_output(&self, handle: &WindowHandle) -> Option<String> {
        let socket = handle.socket_path.as_ref()?;
        if !socket.exists() {
            return None;
        }
        remote_control(socket, &["get-text", "--extent", "screen"])
            .await
            .ok()
    }
}

async fn remote_control(socket: &Path, args: &[&str]) -> Result<String> {
    let kitten = kitten_path()
        .ok_or_else(|| WardenError::Other("kitten binary not found".to_string()))?;

    let mut cmd = Command::new(kitten);
    cmd.arg("@")
        .arg("--to")
        .arg(format!("unix:{}", socket.display()))
        .args(args);

    let output = tokio::time::timeout(Duration::from_secs(5), cmd.output())
        .await
        .map_err(|_| WardenError::Other("kitty remote control timed out".to_string()))??;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(WardenError::Other(format!(
            "kitten @ {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn kitty_path() -> Option<PathBuf> {
    KITTY_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .or_else(|| super::find_in_path("kitty"))
}

fn kitten_path() -> Option<PathBuf> {
    kitty_path()
        .and_then(|kitty| {
            let sibling = kitty.with_file_name("kitten");
            sibling.is_file().then_some(sibling)
        })
        .or_else(|| super::find_in_path("kitten"))
}
