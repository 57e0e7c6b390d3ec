//! smqtt CLI - broker, publisher and subscriber for the smqtt protocol.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{BrokerCommand, PublishCommand, SubscribeCommand};

/// smqtt CLI - run a broker or talk to one.
///
/// Topics are matched exactly; there are no wildcards. Logging honours
/// RUST_LOG and defaults to `info`.
#[derive(Parser)]
#[command(name = "smqtt")]
#[command(about = "Lightweight MQTT broker and client")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a broker until Ctrl-C
    Broker(BrokerCommand),
    /// Publish a message, or each line of stdin
    Pub(PublishCommand),
    /// Subscribe to topics and print incoming messages
    Sub(SubscribeCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Broker(cmd) => cmd.run().await,
        Commands::Pub(cmd) => cmd.run().await,
        Commands::Sub(cmd) => cmd.run().await,
    }
}
