//! Prompt templates.
//!
//! Each spawned CLI receives a rendered template as its working brief.
//! Bodies are plain text with `{variable}` placeholders; operators can
//! replace any body through `[templates.overrides]` in the config.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::TemplateConfig;
use crate::error::{Result, WardenError};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// First prompt of a fresh task session.
    InitialTask,
    /// Brief for a session respawned mid-task.
    ResumeTask,
    /// Ask the CLI to report progress through the callback.
    StatusCheck,
    /// Brief for the cross-review pass.
    Review,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 4] = [
        TemplateKind::InitialTask,
        TemplateKind::ResumeTask,
        TemplateKind::StatusCheck,
        TemplateKind::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialTask => "initial_task",
            Self::ResumeTask => "resume_task",
            Self::StatusCheck => "status_check",
            Self::Review => "review",
        }
    }

    fn default_body(&self) -> &'static str {
        match self {
            Self::InitialTask => DEFAULT_INITIAL_TASK,
            Self::ResumeTask => DEFAULT_RESUME_TASK,
            Self::StatusCheck => DEFAULT_STATUS_CHECK,
            Self::Review => DEFAULT_REVIEW,
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Variables available to every template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: HashMap<&'static str, String>,
}

impl TemplateVars {
    pub fn for_task(task: &Task, cli_type: &str, review_enabled: bool, callback_url: &str) -> Self {
        let mut vars = HashMap::new();
        vars.insert("project_name", task.project_name());
        vars.insert("project_dir", task.project_dir.display().to_string());
        vars.insert("doc_path", task.doc_path.display().to_string());
        vars.insert("full_doc_path", task.full_doc_path().display().to_string());
        vars.insert("task_id", task.id.clone());
        vars.insert("cli_type", cli_type.to_string());
        vars.insert("review_enabled", review_enabled.to_string());
        vars.insert("callback_url", callback_url.to_string());
        Self { vars }
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.vars.insert(key, value.into());
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Immutable set of template bodies. Swapped wholesale on config change;
/// renders in flight keep the snapshot they started with.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    bodies: HashMap<TemplateKind, String>,
}

impl TemplateSet {
    pub fn from_config(config: &TemplateConfig) -> Self {
        let mut bodies = HashMap::new();
        for kind in TemplateKind::ALL {
            let body = config
                .overrides
                .get(kind.as_str())
                .cloned()
                .unwrap_or_else(|| kind.default_body().to_string());
            bodies.insert(kind, body);
        }
        Self { bodies }
    }

    pub fn render(&self, kind: TemplateKind, vars: &TemplateVars) -> Result<String> {
        let body = self
            .bodies
            .get(&kind)
            .ok_or_else(|| WardenError::TemplateNotFound(kind.as_str().to_string()))?;
        Ok(substitute(body, vars))
    }
}

/// Shared RCU handle over the current template set.
#[derive(Clone)]
pub struct TemplateStore {
    inner: Arc<RwLock<Arc<TemplateSet>>>,
}

impl TemplateStore {
    pub fn new(config: &TemplateConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(TemplateSet::from_config(config)))),
        }
    }

    pub fn snapshot(&self) -> Arc<TemplateSet> {
        Arc::clone(&self.inner.read())
    }

    pub fn reload(&self, config: &TemplateConfig) {
        *self.inner.write() = Arc::new(TemplateSet::from_config(config));
    }
}

/// Replaces `{name}` placeholders. Unknown placeholders are left verbatim
/// so a typo shows up in the prompt instead of vanishing silently.
fn substitute(body: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['}', '{', '\n']) {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

const DEFAULT_INITIAL_TASK: &str = "\
You are working in the project `{project_name}` at {project_dir}.

Open `{doc_path}`. It is a Markdown task list: items marked `[x]` are done,
items marked `[ ]` are not. Work through the unchecked items in order.
After finishing an item, update its checkbox from `[ ]` to `[x]` in the
document before moving on.

Status reporting is mandatory. POST to the local orchestrator at these
checkpoints (task id: {task_id}):

    # still working, after each finished item
    curl -s -X POST {callback_url}/api/tasks/{task_id}/notify-status \\
      -H 'Content-Type: application/json' \\
      -d '{\"status\": \"in_progress\"}'

    # every required checkbox is checked
    curl -s -X POST {callback_url}/api/tasks/{task_id}/notify-status \\
      -H 'Content-Type: application/json' \\
      -d '{\"status\": \"completed\"}'

    # you are blocked and cannot continue
    curl -s -X POST {callback_url}/api/tasks/{task_id}/notify-status \\
      -H 'Content-Type: application/json' \\
      -d '{\"status\": \"failed\", \"error\": \"<why>\"}'

Begin by reading the whole document, then start on the first unchecked item.";

const DEFAULT_RESUME_TASK: &str = "\
You are picking up interrupted work on `{project_name}` at {project_dir}.
The task list `{doc_path}` still has unchecked items: read it, then
continue from the first `[ ]` item. Items marked `[x]` are already done;
do not redo them. Update each checkbox as you finish it, and report
status to {callback_url}/api/tasks/{task_id}/notify-status exactly as the
original brief instructed.";

const DEFAULT_STATUS_CHECK: &str = "\
Report your current progress on `{doc_path}` now: POST
{\"status\": \"in_progress\"} (or \"completed\" / \"failed\") to
{callback_url}/api/tasks/{task_id}/notify-status.";

const DEFAULT_REVIEW: &str = "\
You are reviewing completed work in the project `{project_name}` at
{project_dir}. A different assistant implemented the items in `{doc_path}`;
every checkbox is marked done.

Verify each item against the actual code: correctness, missing edge cases,
and claims in the document that the code does not back up. Fix what you
find, or uncheck the item and note why.

When the review passes, POST {\"status\": \"review_completed\"} to
{callback_url}/api/tasks/{task_id}/notify-status. If you run out of
context mid-review, POST {\"status\": \"review_session_completed\"} instead.";
