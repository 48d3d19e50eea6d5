//! Terminal emulator adapters.
//!
//! One variant per supported emulator plus a headless runner for machines
//! without a GUI. A spawned window is represented by a `WindowHandle`
//! carrying whatever identifiers the emulator exposes; some emulators
//! expose nothing, which is why liveness is three-valued.

mod headless;
mod iterm;
mod kitty;
mod windows;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use headless::HeadlessProcess;

use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalChoice {
    #[default]
    Auto,
    Kitty,
    Iterm,
    WindowsTerminal,
    Headless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The emulator offers no introspection for this window.
    Unknown,
}

/// Identifiers for one spawned window. Fields are populated per emulator:
/// kitty sets `socket_path` and `pid`, iTerm sets `window_id`, the
/// headless runner sets `pid` and `process`, Windows Terminal sets nothing.
#[derive(Debug, Clone, Default)]
pub struct WindowHandle {
    pub window_id: Option<String>,
    pub pid: Option<u32>,
    pub socket_path: Option<PathBuf>,
    pub(crate) process: Option<HeadlessProcess>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Kitty,
    Iterm,
    WindowsTerminal,
    Headless,
}

impl TerminalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kitty => "kitty",
            Self::Iterm => "iterm",
            Self::WindowsTerminal => "windows_terminal",
            Self::Headless => "headless",
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum TerminalAdapter {
    Kitty(kitty::KittyTerminal),
    Iterm(iterm::ItermTerminal),
    WindowsTerminal(windows::WtTerminal),
    Headless(headless::HeadlessTerminal),
}

impl TerminalAdapter {
    /// Resolves the operator's preference, or auto-detects by platform.
    /// Unavailability is an error here, not a panic: the session manager
    /// maps it to a failed spawn, never a crashed core.
    pub fn resolve(choice: TerminalChoice) -> Result<Self> {
        let adapter = match choice {
            TerminalChoice::Kitty => Self::Kitty(kitty::KittyTerminal::new()),
            TerminalChoice::Iterm => Self::Iterm(iterm::ItermTerminal::new()),
            TerminalChoice::WindowsTerminal => {
                Self::WindowsTerminal(windows::WtTerminal::new())
            }
            TerminalChoice::Headless => Self::Headless(headless::HeadlessTerminal::new()),
            TerminalChoice::Auto => {
                return Self::auto_detect().ok_or_else(|| {
                    WardenError::TerminalUnavailable(
                        "no supported terminal emulator found on this system".to_string(),
                    )
                });
            }
        };
        if !adapter.is_available() {
            return Err(WardenError::TerminalUnavailable(format!(
                "{} is not installed",
                adapter.kind()
            )));
        }
        Ok(adapter)
    }

    fn auto_detect() -> Option<Self> {
        let mut candidates: Vec<TerminalAdapter> = Vec::new();
        if cfg!(target_os = "macos") {
            candidates.push(Self::Kitty(kitty::KittyTerminal::new()));
            candidates.push(Self::Iterm(iterm::ItermTerminal::new()));
        } else if cfg!(target_os = "linux") {
            candidates.push(Self::Kitty(kitty::KittyTerminal::new()));
        } else if cfg!(target_os = "windows") {
            candidates.push(Self::WindowsTerminal(windows::WtTerminal::new()));
        }
        // Always runnable, so unattended hosts still work.
        candidates.push(Self::Headless(headless::HeadlessTerminal::new()));
        candidates.into_iter().find(|a| a.is_available())
    }

    pub fn kind(&self) -> TerminalKind {
        match self {
            Self::Kitty(_) => TerminalKind::Kitty,
            Self::Iterm(_) => TerminalKind::Iterm,
            Self::WindowsTerminal(_) => TerminalKind::WindowsTerminal,
            Self::Headless(_) => TerminalKind::Headless,
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Self::Kitty(t) => t.is_available(),
            Self::Iterm(t) => t.is_available(),
            Self::WindowsTerminal(t) => t.is_available(),
            Self::Headless(t) => t.is_available(),
        }
    }

    /// Opens a window in `directory` running `argv`.
    pub async fn spawn(&self, directory: &Path, argv: &[String]) -> Result<WindowHandle> {
        if argv.is_empty() {
            return Err(WardenError::SpawnFailed("empty command".to_string()));
        }
        match self {
            Self::Kitty(t) => t.spawn(directory, argv).await,
            Self::Iterm(t) => t.spawn(directory, argv).await,
            Self::WindowsTerminal(t) => t.spawn(directory, argv).await,
            Self::Headless(t) => t.spawn(directory, argv).await,
        }
    }

    pub async fn is_alive(&self, handle: &WindowHandle) -> Liveness {
        match self {
            Self::Kitty(t) => t.is_alive(handle).await,
            Self::Iterm(t) => t.is_alive(handle).await,
            Self::WindowsTerminal(t) => t.is_alive(handle).await,
            Self::Headless(t) => t.is_alive(handle).await,
        }
    }

    /// Best-effort, idempotent close of the window.
    pub async fn close(&self, handle: &WindowHandle) {
        match self {
            Self::Kitty(t) => t.close(handle).await,
            Self::Iterm(t) => t.close(handle).await,
            Self::WindowsTerminal(t) => t.close(handle).await,
            Self::Headless(t) => t.close(handle).await,
        }
    }

    /// Snapshot of the window's recent output, where the emulator can be
    /// asked for one. `None` means "no visibility", not "no output".
    pub async fn capture_output(&self, handle: &WindowHandle) -> Option<String> {
        match self {
            Self::Kitty(t) => t.capture_output(handle).await,
            Self::Iterm(t) => t.capture_output(handle).await,
            Self::WindowsTerminal(_) => None,
            Self::Headless(t) => t.capture_output(handle).await,
        }
    }
}

/// Probes whether an OS process exists. Used as the liveness fallback when
/// the emulator only reports `Unknown`.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> bool {
    use std::process::Command;
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|o| {
            let out = String::from_utf8_lossy(&o.stdout);
            o.status.success() && out.contains(&pid.to_string())
        })
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Joins argv into a single `sh -c` compatible command line.
pub(crate) fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
