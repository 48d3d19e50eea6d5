//! iTerm2 adapter, scripted through AppleScript. Window creation briefly
//! steals focus; iTerm offers no focus-free spawn path.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::{Liveness, WindowHandle, shell_join};
use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Default)]
pub struct ItermTerminal;

impl ItermTerminal {
    pub fn new() -> Self {
        Self
    }

    pub fn is_available(&self) -> bool {
        cfg!(target_os = "macos") && Path::new("/Applications/iTerm.app").exists()
    }

    pub async fn spawn(&self, directory: &Path, argv: &[String]) -> Result<WindowHandle> {
        let command_line = format!(
            "cd {} && {}",
            shell_join(&[directory.display().to_string()]),
            shell_join(argv)
        );
        let script = format!(
            r#"tell application "iTerm"
                set newWindow to (create window with default profile)
                tell current session of newWindow
                    write text "{}"
                end tell
                return id of newWindow
            end tell"#,
            escape_applescript(&command_line)
        );

        let output = osascript(&script).await?;
        let window_id = output.trim().to_string();
        if window_id.is_empty() {
            return Err(WardenError::SpawnFailed(
                "iTerm did not return a window id".to_string(),
            ));
        }

        Ok(WindowHandle {
            window_id: Some(window_id),
            ..WindowHandle::default()
        })
    }

    pub async fn is_alive(&self, handle: &WindowHandle) -> Liveness {
        let Some(window_id) = &handle.window_id else {
            return Liveness::Unknown;
        };
        let script = format!(
            r#"tell application "iTerm"
                repeat with w in windows
                    if (id of w as string) is "{}" then return "alive"
                end repeat
                return "dead"
            end tell"#,
            escape_applescript(window_id)
        );
        match osascript(&script).await {
            Ok(out) if out.trim() == "alive" => Liveness::Alive,
            Ok(_) => Liveness::Dead,
            // Scripting failure says nothing about the window itself.
            Err(e) => {
                debug!(error = %e, "iTerm liveness probe failed");
                Liveness::Unknown
            }
        }
    }

    pub async fn close(&self, handle: &WindowHandle) {
        let Some(window_id) = &handle.window_id else {
            return;
        };
        let script = format!(
            r#"tell application "iTerm"
                repeat with w in windows
                    if (id of w as string) is "{}" then close w
                end repeat
            end tell"#,
            escape_applescript(window_id)
        );
        if let Err(e) = osascript(&script).await {
            debug!(error = %e, "iTerm close failed");
        }
    }

    pub async fn capture_output(&self, handle: &WindowHandle) -> Option<String> {
        let window_id = handle.window_id.as_ref()?;
        let script = format!(
            r#"tell application "iTerm"
                repeat with w in windows
                    if (id of w as string) is "{}" then
                        return contents of current session of w
                    end if
                end repeat
                return ""
            end tell"#,
            escape_applescript(window_id)
        );
        osascript(&script).await.ok().filter(|s| !s.is_empty())
    }
}

async fn osascript(script: &str) -> Result<String> {
    let mut cmd = Command::new("osascript");
    cmd.args(["-e", script]);

    let output = tokio::time::timeout(Duration::from_secs(10), cmd.output())
        .await
        .map_err(|_| WardenError::SpawnFailed("osascript timed out".to_string()))??;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(WardenError::SpawnFailed(format!(
            "osascript: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn escape_applescript(text: &str) -> String {
    text.replace('\\', r"\\").replace('"', r#"\""#)
}
