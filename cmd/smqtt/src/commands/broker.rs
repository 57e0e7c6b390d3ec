//! Broker command.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use smqtt::{Broker, BrokerConfig};
use tracing::info;

/// Run a broker until Ctrl-C.
#[derive(Args)]
pub struct BrokerCommand {
    /// Listen host (overrides config file)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Listen port (overrides config file)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Broker config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl BrokerCommand {
    pub async fn run(&self) -> anyhow::Result<()> {
        let config = self.resolve_config()?;
        config.validate()?;

        let broker = Broker::builder(config)
            .on_connect(|client_id| info!("[+] {}", client_id))
            .on_disconnect(|client_id| info!("[-] {}", client_id))
            .build();

        let shutdown = broker.shutdown_token();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => info!("Failed to listen for Ctrl-C: {}, shutting down", e),
            }
            shutdown.cancel();
        });

        broker
            .serve()
            .await
            .with_context(|| format!("broker on {} failed", broker.config().addr()))
    }

    /// Load the config file, if any, then apply flag overrides.
    fn resolve_config(&self) -> anyhow::Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => BrokerConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> anyhow::Result<BrokerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cmd = BrokerCommand {
            host: Some("127.0.0.1".to_string()),
            port: Some(1999),
            config: None,
        };
        let config = cmd.resolve_config().unwrap();
        assert_eq!(config.addr(), "127.0.0.1:1999");
        assert_eq!(config.outbound_queue, smqtt::DEFAULT_OUTBOUND_QUEUE);
    }

    #[test]
    fn test_missing_config_file() {
        let cmd = BrokerCommand {
            host: None,
            port: None,
            config: Some(PathBuf::from("/nonexistent/smqtt.yaml")),
        };
        assert!(cmd.resolve_config().is_err());
    }
}
