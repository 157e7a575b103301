mod commands;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forge_sandbox::SandboxService;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "forge")]
#[command(about = "Run generated applications in isolated sandboxes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the sandbox HTTP API
    Serve {
        /// Engine configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Check a bundle directory against the security policy
    Validate {
        /// Bundle directory
        dir: PathBuf,

        /// Engine configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Execute a bundle directory and follow its logs
    Run {
        /// Bundle directory
        dir: PathBuf,

        /// Sandbox id (default: derived from the directory name)
        #[arg(long)]
        id: Option<String>,

        /// Engine configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Use container isolation regardless of configuration
        #[arg(long)]
        container: bool,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            verbose,
        } => {
            let _guard = init_tracing(verbose);
            run_server(config, bind).await
        }
        Commands::Validate { dir, config } => commands::execute_validate(dir, config),
        Commands::Run {
            dir,
            id,
            config,
            container,
            verbose,
        } => {
            let _guard = init_tracing(verbose);
            commands::execute_run(dir, id, config, container).await
        }
    }
}

/// Tracing to stderr and to `forge.log` in the working directory.
/// The returned guard flushes the file writer on drop.
fn init_tracing(verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let log_level = if verbose { "debug" } else { "info" };

    let file_appender = tracing_appender::rolling::never(".", "forge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "forge={},forge_sandbox={},tower_http={}",
                    log_level, log_level, log_level
                ))
            }),
        )
        .init();

    guard
}

async fn run_server(config: Option<PathBuf>, bind: String) -> Result<()> {
    let config = commands::load_config(config.as_deref())?;
    info!("Isolation: {}", config.isolation);
    info!("Workspace root: {}", config.workspace_root.display());

    let service = SandboxService::init(config).await?;
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    server::start_server(listener, service).await
}
