//! aoai-relay daemon - serves the OpenAI API surface on top of Azure OpenAI

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use aoai_relay::config::Config;
use aoai_relay::error::Result;
use aoai_relay::proxy::ProxyServer;

/// aoai-relay - OpenAI-compatible reverse proxy for Azure OpenAI
#[derive(Parser)]
#[command(name = "aoai-relay")]
#[command(about = "An OpenAI-compatible reverse proxy for Azure OpenAI deployments")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
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
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aoai_relay=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting aoai-relay");

    let config = Config::load(config_path.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);

    let server = ProxyServer::new(&config)?;
    server.serve().await?;

    tracing::info!("aoai-relay stopped");
    Ok(())
}
