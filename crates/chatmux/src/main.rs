//! Chatmux daemon - session-multiplexing front end for upstream chat credentials

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use chatmux::config::{CONFIG_PATH_ENV, Config};
use chatmux::error::Result;
use chatmux::server::{ChatServer, StreamFramer};
use chatmux::session::{CredentialPool, Orchestrator, SessionRegistry};
use chatmux::upstream::ChatGptConnector;

/// Chatmux - multiplex chat users across a pool of upstream credentials
#[derive(Parser)]
#[command(name = "chatmux")]
#[command(about = "Multiplex chat users across a pool of upstream credentials")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true, env = CONFIG_PATH_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the chat server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chatmux=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting chatmux daemon");

    let config = Config::load(config_path.as_deref())?;
    tracing::debug!(
        "Config loaded: {} credential(s), listening on {}",
        config.engine.tokens.len(),
        config.server.listen_addr()
    );

    let connector = Arc::new(ChatGptConnector::new(&config.upstream)?);

    tracing::info!("Logging in {} credential(s)...", config.engine.tokens.len());
    let pool = CredentialPool::connect(&config.engine.tokens, connector).await?;
    pool.set_verbose(config.server.debug);
    tracing::info!("Credential pool ready");

    let registry = Arc::new(
        SessionRegistry::new(Arc::new(pool)).with_stale_after(config.session.stale_after()),
    );
    let orchestrator = Arc::new(Orchestrator::new(registry));
    let framer = StreamFramer::from_config(&config.stream);

    let server = ChatServer::new(config.server.clone(), orchestrator, framer);
    server.serve().await?;

    tracing::info!("Chatmux daemon stopped");
    Ok(())
}
