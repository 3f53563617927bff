//! Codedeck - Local control plane for repository-scoped coding agent sessions
//!
//! Serves the gateway and HTTP API, and manages the repository registry
//! from the command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use codedeck::config::CodedeckConfig;
use codedeck::gateway;
use codedeck::registry::RepoRegistry;
use codedeck::session::ProcessSessionFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "codedeck")]
#[command(version)]
#[command(about = "Local control plane for repository-scoped coding agent sessions")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CODEDECK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the codedeck server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Manage the repository registry
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Register a repository
    Add {
        /// Path to the repository
        path: PathBuf,

        /// Display name
        #[arg(long)]
        name: Option<String>,
    },

    /// List registered repositories
    List,

    /// Remove a repository from the registry
    Remove {
        /// Repo id to remove
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "codedeck=debug" } else { "codedeck=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = CodedeckConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Commands::Repo { command } => {
            let registry = RepoRegistry::open(config.storage.registry_file())?;
            match command {
                RepoCommands::Add { path, name } => {
                    let path = path.canonicalize()?;
                    let entry = registry.add(path, name)?;
                    println!("{}  {}", entry.id, entry.path.display());
                }
                RepoCommands::List => {
                    for entry in registry.list() {
                        let name = entry.name.as_deref().unwrap_or("-");
                        println!("{}  {}  {}", entry.id, name, entry.path.display());
                    }
                }
                RepoCommands::Remove { id } => {
                    if registry.remove(&id)? {
                        println!("removed {id}");
                    } else {
                        println!("no repository with id {id}");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn serve(config: CodedeckConfig) -> Result<()> {
    let registry = Arc::new(RepoRegistry::open(config.storage.registry_file())?);
    let factory = Arc::new(ProcessSessionFactory {
        agent: config.agent.clone(),
        session: config.session.clone(),
    });

    let app = gateway::build_app(&config, registry, factory, None);
    let handle = gateway::start(&config.server, app.state.clone()).await?;
    tracing::info!(port = handle.port, "Codedeck ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    app.state.refresher.clear().await;
    app.state.manager.stop_all().await;
    Ok(())
}
