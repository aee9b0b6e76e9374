mod backend_file;
mod config;
mod run_cmd;
mod serve_cmd;
mod status_cmd;
mod tasks_cmd;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::ConfigFile;

#[derive(Parser)]
#[command(name = "drover", about = "Model-aware task loop for AI coding-agent CLIs")]
struct Cli {
    /// Project directory holding the .drover state dir (default: cwd)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Namespace, for running several independent loops side by side
    #[arg(long, global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the task loop until the backlog drains or a stop signal
    Run {
        /// Stop after this many iterations
        #[arg(long)]
        max_iterations: Option<u64>,
        /// Task file (default: .drover/tasks.json)
        #[arg(long)]
        tasks_file: Option<PathBuf>,
        /// Enqueue a remediation task when a task fails terminally
        #[arg(long)]
        remediate: bool,
    },
    /// Serve the read-only observability HTTP/SSE endpoint
    Serve {
        /// Bind address (default from config)
        #[arg(long)]
        bind: Option<String>,
        /// Port (default from config)
        #[arg(long)]
        port: Option<u16>,
        /// Task file (default: .drover/tasks.json)
        #[arg(long)]
        tasks_file: Option<PathBuf>,
    },
    /// Show persisted loop state and live loops
    Status,
    /// List the task backlog
    Tasks {
        /// Filter by status (pending, in-progress, completed, failed, ...)
        #[arg(long)]
        status: Option<String>,
        /// Task file (default: .drover/tasks.json)
        #[arg(long)]
        tasks_file: Option<PathBuf>,
    },
}

fn project_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.project_dir {
        Some(dir) => Ok(dir.clone()),
        None => std::env::current_dir().context("failed to resolve current directory"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let dir = project_dir(&cli)?;

    match cli.command {
        Commands::Init { force } => {
            let path = config::config_path();
            if path.exists() && !force {
                bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let written = ConfigFile::default().save()?;
            println!("wrote {}", written.display());
            Ok(())
        }
        Commands::Run {
            max_iterations,
            tasks_file,
            remediate,
        } => {
            let config = ConfigFile::load_or_default()?;
            let max_iterations = match max_iterations {
                Some(n) => Some(n),
                None => config::env_parse("DROVER_MAX_ITERATIONS")?,
            };
            let code = run_cmd::run(
                config,
                run_cmd::RunArgs {
                    project_dir: dir,
                    namespace: cli.namespace,
                    max_iterations,
                    tasks_file,
                    remediate,
                },
            )
            .await?;
            std::process::exit(code);
        }
        Commands::Serve {
            bind,
            port,
            tasks_file,
        } => {
            let config = ConfigFile::load_or_default()?;
            serve_cmd::run(
                config,
                serve_cmd::ServeArgs {
                    project_dir: dir,
                    namespace: cli.namespace,
                    bind,
                    port,
                    tasks_file,
                },
            )
            .await
        }
        Commands::Status => status_cmd::run(dir, cli.namespace),
        Commands::Tasks { status, tasks_file } => {
            tasks_cmd::run(dir, cli.namespace, tasks_file, status).await
        }
    }
}
