mod settings;

pub use settings::{
    BroadcastConfig, CliConfig, CliOverride, ConfigHandle, ContextConfig, ReviewConfig,
    SessionConfig, TemplateConfig, WardenConfig, WatchdogConfig,
};
