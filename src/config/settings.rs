use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cli::CliKind;
use crate::error::{Result, WardenError};
use crate::terminal::TerminalChoice;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub session: SessionConfig,
    pub watchdog: WatchdogConfig,
    pub context: ContextConfig,
    pub review: ReviewConfig,
    pub cli: CliConfig,
    pub broadcast: BroadcastConfig,
    pub templates: TemplateConfig,
    /// Terminal emulator preference; `auto` picks by platform.
    pub terminal: TerminalChoice,
    /// Base URL the spawned CLIs are told to report status to.
    pub callback_base_url: String,
    /// Where rendered prompt files are written. Defaults to the OS temp dir.
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_concurrent: usize,
    pub spawn_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// Pass each CLI's auto-approve flag so sessions run unattended.
    pub dangerous: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            spawn_timeout_secs: 10,
            stop_grace_secs: 5,
            dangerous: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            heartbeat_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Remaining-context percentage at which a restart is advised.
    pub restart_threshold_percent: u8,
    /// Sessions younger than this never restart on context readings.
    pub min_run_secs: u64,
    /// How often each session monitor samples terminal output.
    pub poll_interval_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            restart_threshold_percent: 15,
            min_run_secs: 60,
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Global cross-review toggle; tasks may override it either way.
    pub enabled: bool,
    /// CLI used for the review pass. Must differ from the executing CLI to
    /// be a cross-review; when equal, the review CLI falls back to the
    /// first other available kind.
    pub cli: CliKind,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cli: CliKind::Codex,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub default: CliKind,
    /// Per-CLI installation overrides, keyed by kind name (`claude_code`,
    /// `codex`, `gemini`).
    pub overrides: HashMap<String, CliOverride>,
}

impl CliConfig {
    pub fn override_for(&self, kind: CliKind) -> Option<&CliOverride> {
        self.overrides.get(kind.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliOverride {
    pub command: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Operator-provided template bodies, keyed by template kind name.
    pub overrides: HashMap<String, String>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            watchdog: WatchdogConfig::default(),
            context: ContextConfig::default(),
            review: ReviewConfig::default(),
            cli: CliConfig::default(),
            broadcast: BroadcastConfig::default(),
            templates: TemplateConfig::default(),
            terminal: TerminalChoice::Auto,
            callback_base_url: "http://127.0.0.1:8086".to_string(),
            scratch_dir: None,
        }
    }
}

impl WardenConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| WardenError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.session.max_concurrent == 0 {
            errors.push("session.max_concurrent must be at least 1");
        }
        if self.session.max_concurrent > 16 {
            errors.push("session.max_concurrent must not exceed 16");
        }
        if self.session.spawn_timeout_secs == 0 {
            errors.push("session.spawn_timeout_secs must be greater than 0");
        }
        if self.watchdog.check_interval_secs == 0 {
            errors.push("watchdog.check_interval_secs must be greater than 0");
        }
        if self.watchdog.heartbeat_timeout_secs < self.watchdog.check_interval_secs {
            errors.push("watchdog.heartbeat_timeout_secs must be >= check_interval_secs");
        }
        if self.context.restart_threshold_percent == 0
            || self.context.restart_threshold_percent > 50
        {
            errors.push("context.restart_threshold_percent must be in 1..=50");
        }
        if self.context.poll_interval_secs == 0 {
            errors.push("context.poll_interval_secs must be greater than 0");
        }
        if self.broadcast.queue_capacity == 0 {
            errors.push("broadcast.queue_capacity must be greater than 0");
        }
        if self.callback_base_url.is_empty() {
            errors.push("callback_base_url must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WardenError::Config(errors.join("; ")))
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("taskwarden"))
    }
}

/// Read-copy-update handle for the live configuration.
///
/// Readers take a snapshot once per operation and keep it for the whole
/// operation; writers publish a new immutable snapshot atomically. No hot
/// path ever holds a lock across a suspension point.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<WardenConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<WardenConfig> {
        Arc::clone(&self.inner.read())
    }

    pub fn replace(&self, config: WardenConfig) -> Result<()> {
        config.validate()?;
        *self.inner.write() = Arc::new(config);
        Ok(())
    }

    pub fn update(&self, mutate: impl FnOnce(&mut WardenConfig)) -> Result<()> {
        let mut next = (*self.snapshot()).clone();
        mutate(&mut next);
        self.replace(next)
    }
}
