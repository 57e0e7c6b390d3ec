//! Options shared by the client commands.

use anyhow::Context;
use clap::Args;
use smqtt::{ClientConfig, DEFAULT_PORT, QoS};

/// Prefix of generated client ids.
const CLIENT_ID_PREFIX: &str = "smqtt-";

/// Broker address and identity of a client command.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Broker host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Client id (generated when omitted)
    #[arg(short = 'c', long = "client-id")]
    pub client_id: Option<String>,

    /// Keep alive interval in seconds
    #[arg(short = 'k', long = "keep-alive", default_value_t = 60)]
    pub keep_alive: u16,
}

impl ConnectionArgs {
    /// Build the client config for these options at `qos`.
    pub fn client_config(&self, qos: u8) -> anyhow::Result<ClientConfig> {
        let qos = QoS::try_from(qos).context("invalid qos")?;
        let client_id = self.client_id.clone().unwrap_or_else(generate_client_id);

        Ok(ClientConfig::new(&self.host, self.port, client_id)
            .with_qos(qos)
            .with_keep_alive(self.keep_alive))
    }

    /// Broker address as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Generate a client id: the prefix plus 16 hex digits of a random UUID.
pub fn generate_client_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}{}", &uuid[..16])
}
