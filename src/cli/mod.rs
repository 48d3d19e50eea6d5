//! CLI adapters.
//!
//! One variant per supported assistant CLI. The session manager never
//! branches on the concrete kind; everything it needs goes through the
//! capability methods here.

mod claude_code;
mod codex;
mod gemini;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::CliOverride;
use crate::error::{Result, WardenError};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliKind {
    #[default]
    ClaudeCode,
    Codex,
    Gemini,
}

impl CliKind {
    pub const ALL: [CliKind; 3] = [CliKind::ClaudeCode, CliKind::Codex, CliKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude_code",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    /// Human-readable product name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "Claude Code",
            Self::Codex => "Codex CLI",
            Self::Gemini => "Gemini CLI",
        }
    }

    fn default_binary(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    fn auto_approve_flag(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "--dangerously-skip-permissions",
            Self::Codex => "--yolo",
            Self::Gemini => "-y",
        }
    }
}

impl fmt::Display for CliKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CliKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "claude_code" | "claude" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            other => Err(WardenError::Config(format!("unknown CLI kind: {other}"))),
        }
    }
}

/// Resolved launch parameters for one CLI installation.
#[derive(Debug, Clone)]
pub struct CliProfile {
    pub command: PathBuf,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum CliAdapter {
    ClaudeCode(CliProfile),
    Codex(CliProfile),
    Gemini(CliProfile),
}

impl CliAdapter {
    /// Locates the CLI binary, honoring the operator's override, and fails
    /// with `CliUnavailable` when nothing runnable is found.
    pub fn resolve(kind: CliKind, overrides: Option<&CliOverride>) -> Result<Self> {
        let command = match overrides.and_then(|o| o.command.clone()) {
            Some(cmd) => locate(&cmd)
                .ok_or_else(|| WardenError::CliUnavailable(cmd.display().to_string()))?,
            None => default_command(kind)
                .ok_or_else(|| WardenError::CliUnavailable(kind.as_str().to_string()))?,
        };
        let profile = CliProfile {
            command,
            extra_args: overrides.map(|o| o.extra_args.clone()).unwrap_or_default(),
        };
        Ok(match kind {
            CliKind::ClaudeCode => Self::ClaudeCode(profile),
            CliKind::Codex => Self::Codex(profile),
            CliKind::Gemini => Self::Gemini(profile),
        })
    }

    pub fn kind(&self) -> CliKind {
        match self {
            Self::ClaudeCode(_) => CliKind::ClaudeCode,
            Self::Codex(_) => CliKind::Codex,
            Self::Gemini(_) => CliKind::Gemini,
        }
    }

    fn profile(&self) -> &CliProfile {
        match self {
            Self::ClaudeCode(p) | Self::Codex(p) | Self::Gemini(p) => p,
        }
    }

    /// Builds the argv that boots the CLI inside the project directory.
    ///
    /// The rendered prompt lives in `prompt_file`; the CLI is told to read
    /// it as its first instruction rather than having the whole prompt
    /// spliced onto the command line.
    pub fn launch_command(&self, _directory: &Path, prompt_file: &Path, dangerous: bool) -> Vec<String> {
        let profile = self.profile();
        let mut argv = vec![profile.command.display().to_string()];
        if dangerous {
            argv.push(self.kind().auto_approve_flag().to_string());
        }
        argv.extend(profile.extra_args.iter().cloned());

        let bootstrap = format!(
            "Read the file {} and follow the instructions in it exactly.",
            prompt_file.display()
        );
        match self {
            Self::ClaudeCode(_) | Self::Codex(_) => argv.push(bootstrap),
            Self::Gemini(_) => {
                argv.push("-i".to_string());
                argv.push(bootstrap);
            }
        }
        argv
    }

    /// Scans an output chunk for the CLI's context indicator. `None` means
    /// "no new information", never zero.
    pub fn parse_context_remaining(&self, chunk: &str) -> Option<u8> {
        match self {
            Self::ClaudeCode(_) => claude_code::parse_context_remaining(chunk),
            Self::Codex(_) => codex::parse_context_remaining(chunk),
            Self::Gemini(_) => gemini::parse_context_remaining(chunk),
        }
    }

    /// True when the output tail shows the CLI sitting at its input prompt.
    pub fn idle_signature(&self, tail: &str) -> bool {
        match self {
            Self::ClaudeCode(_) => claude_code::is_idle(tail),
            Self::Codex(_) => codex::is_idle(tail),
            Self::Gemini(_) => gemini::is_idle(tail),
        }
    }

    /// The prompt injected when a session is restarted mid-task.
    pub fn resume_prompt(&self, task: &Task) -> String {
        format!(
            "You are resuming interrupted work on project `{project}`.\n\n\
             Open `{doc}` in this directory. It is a Markdown task list: items \
             marked `[x]` are finished, items marked `[ ]` are not. Start from \
             the first unchecked item and work through the remaining items in \
             order. Check each box off in the document as you complete it.\n\n\
             Do not redo finished items. Task id: {task_id}.",
            project = task.project_name(),
            doc = task.doc_path.display(),
            task_id = task.id,
        )
    }
}

fn default_command(kind: CliKind) -> Option<PathBuf> {
    if kind == CliKind::ClaudeCode {
        // Claude Code installs itself outside PATH by default.
        if let Some(home) = std::env::var_os("HOME") {
            let local = PathBuf::from(home).join(".claude/local/claude");
            if local.is_file() {
                return Some(local);
            }
        }
    }
    find_in_path(kind.default_binary())
}

fn locate(cmd: &Path) -> Option<PathBuf> {
    if cmd.components().count() > 1 {
        return cmd.is_file().then(|| cmd.to_path_buf());
    }
    find_in_path(&cmd.display().to_string())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(kind: CliKind) -> CliAdapter {
        let profile = CliProfile {
            command: PathBuf::from("/usr/local/bin/tool"),
            extra_args: vec![],
        };
        match kind {
            CliKind::ClaudeCode => CliAdapter::ClaudeCode(profile),
            CliKind::Codex => CliAdapter::Codex(profile),
            CliKind::Gemini => CliAdapter::Gemini(profile),
        }
    }

    #[test]
    fn test_launch_command_dangerous_flags() {
        let dir = Path::new("/srv/demo");
        let prompt = Path::new("/tmp/prompt.md");

        let argv = adapter(CliKind::ClaudeCode).launch_command(dir, prompt, true);
        assert_eq!(argv[1], "--dangerously-skip-permissions");

        let argv = adapter(CliKind::Codex).launch_command(dir, prompt, true);
        assert_eq!(argv[1], "--yolo");

        let argv = adapter(CliKind::Gemini).launch_command(dir, prompt, true);
        assert_eq!(argv[1], "-y");
        assert_eq!(argv[2], "-i");

        let argv = adapter(CliKind::ClaudeCode).launch_command(dir, prompt, false);
        assert!(!argv.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_launch_command_references_prompt_file() {
        let argv = adapter(CliKind::Codex).launch_command(
            Path::new("/srv/demo"),
            Path::new("/tmp/warden/t1.md"),
            true,
        );
        assert!(argv.last().unwrap().contains("/tmp/warden/t1.md"));
    }

    #[test]
    fn test_resume_prompt_mentions_doc_and_checkboxes() {
        let task = Task::new("/srv/projects/demo", "docs/plan.md");
        let prompt = adapter(CliKind::ClaudeCode).resume_prompt(&task);
        assert!(prompt.contains("docs/plan.md"));
        assert!(prompt.contains("first unchecked"));
        assert!(prompt.contains(&task.id));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("claude".parse::<CliKind>().unwrap(), CliKind::ClaudeCode);
        assert_eq!("codex".parse::<CliKind>().unwrap(), CliKind::Codex);
        assert!("vim".parse::<CliKind>().is_err());
    }

    #[test]
    fn test_resolve_unavailable_cli() {
        let missing = CliOverride {
            command: Some(PathBuf::from("/definitely/not/installed")),
            extra_args: vec![],
        };
        let err = CliAdapter::resolve(CliKind::Codex, Some(&missing)).unwrap_err();
        assert!(matches!(err, WardenError::CliUnavailable(_)));
    }

    #[test]
    fn test_resolve_with_override_path() {
        // `sh` exists everywhere we run tests.
        let sh = find_in_path("sh").expect("sh on PATH");
        let over = CliOverride {
            command: Some(sh.clone()),
            extra_args: vec!["-c".into()],
        };
        let adapter = CliAdapter::resolve(CliKind::Gemini, Some(&over)).unwrap();
        assert_eq!(adapter.kind(), CliKind::Gemini);
        let argv = adapter.launch_command(Path::new("/"), Path::new("/tmp/p.md"), false);
        assert_eq!(argv[0], sh.display().to_string());
        assert_eq!(argv[1], "-c");
    }
}
