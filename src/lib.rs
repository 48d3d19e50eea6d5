pub mod broadcast;
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod task;
pub mod template;
pub mod terminal;

pub use broadcast::{SessionView, StatusBroadcaster, StatusSnapshot, Subscriber};
pub use cli::{CliAdapter, CliKind};
pub use config::{ConfigHandle, WardenConfig};
pub use error::{Result, WardenError};
pub use orchestrator::{NotifyOutcome, ReportedStatus, StatusReport, Warden};
pub use session::{ContextTracker, SessionManager, StartOutcome, Watchdog};
pub use task::{
    DocProgress, MemoryTaskStore, ProgressInspector, ReviewMode, SqliteTaskStore, Task,
    TaskStatus, TaskStore,
};
pub use template::{TemplateKind, TemplateStore, TemplateVars};
pub use terminal::{Liveness, TerminalAdapter, TerminalChoice};
