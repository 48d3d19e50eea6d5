use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use taskwarden::config::WardenConfig;
use taskwarden::error::Result;
use taskwarden::orchestrator::Warden;
use taskwarden::task::{ReviewMode, SqliteTaskStore, Task, TaskStore, store};

#[derive(Parser)]
#[command(name = "taskwarden", version, about = "Supervises CLI coding assistants working through Markdown task lists")]
struct Cli {
    /// Configuration file (default: ./warden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Task database (default: ./taskwarden.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default warden.toml next to the task database
    Init,
    /// Run the supervisor until interrupted
    Run,
    /// Create a task and start it
    Add {
        /// Project directory the CLI will work in
        project_dir: PathBuf,
        /// Checkbox document, relative to the project directory
        doc_path: PathBuf,
        /// CLI to use (claude_code, codex, gemini)
        #[arg(long)]
        cli: Option<String>,
        /// Force cross-review on or off for this task
        #[arg(long)]
        review: Option<bool>,
        /// Create without starting
        #[arg(long)]
        no_start: bool,
    },
    /// Show tasks and live sessions
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("taskwarden=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskwarden=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("warden.toml"));
    let db_path = cli.db.clone().unwrap_or_else(|| PathBuf::from("taskwarden.db"));

    match cli.command {
        Commands::Init => {
            let config = WardenConfig::default();
            config.save(&config_path)?;
            println!("wrote {}", config_path.display());
            Ok(())
        }
        Commands::Run => {
            let config = WardenConfig::load(&config_path)?;
            let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&db_path)?);
            let warden = Warden::new(config, store)?;
            warden.start().await?;

            tokio::signal::ctrl_c().await?;
            warden.shutdown().await;
            Ok(())
        }
        Commands::Add {
            project_dir,
            doc_path,
            cli: cli_kind,
            review,
            no_start,
        } => {
            let config = WardenConfig::load(&config_path)?;
            let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&db_path)?);

            let project_dir = project_dir.canonicalize()?;
            store::validate_paths(&project_dir, &doc_path)?;

            let mut task = Task::new(project_dir, doc_path);
            if let Some(kind) = cli_kind {
                task = task.with_cli(kind.parse()?);
            }
            if let Some(enabled) = review {
                task = task.with_review(if enabled {
                    ReviewMode::Enabled
                } else {
                    ReviewMode::Disabled
                });
            }
            store.create(&task)?;
            println!("created task {}", task.id);

            if !no_start {
                let warden = Warden::new(config, store)?;
                warden.start().await?;
                warden.start_task(&task.id).await?;
                println!("started; press ctrl-c to stop supervising");
                tokio::signal::ctrl_c().await?;
                warden.shutdown().await;
            }
            Ok(())
        }
        Commands::Status => {
            let config = WardenConfig::load(&config_path)?;
            let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&db_path)?);

            println!(
                "max concurrent sessions: {}",
                config.session.max_concurrent
            );
            let tasks = store.all()?;
            if tasks.is_empty() {
                println!("no tasks");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{}  {:<12}  {}  {}",
                    task.id,
                    task.status.to_string(),
                    task.project_dir.display(),
                    task.doc_path.display()
                );
                if let Some(err) = &task.last_error {
                    println!("    last error: {err}");
                }
            }
            Ok(())
        }
    }
}
