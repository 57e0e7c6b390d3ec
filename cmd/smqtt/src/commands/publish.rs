//! Publish command.

use anyhow::Context;
use clap::Args;
use smqtt::Client;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use super::ConnectionArgs;

/// Publish a message, or each line of stdin when no message is given.
#[derive(Args)]
pub struct PublishCommand {
    #[command(flatten)]
    conn: ConnectionArgs,

    /// Topic to publish to
    #[arg(short = 't', long)]
    topic: String,

    /// Message payload (reads stdin line by line when omitted)
    #[arg(short = 'm', long)]
    message: Option<String>,

    /// QoS level
    #[arg(short = 'q', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: u8,
}

impl PublishCommand {
    pub async fn run(&self) -> anyhow::Result<()> {
        let config = self.conn.client_config(self.qos)?;
        let mut client = Client::connect(config)
            .await
            .with_context(|| format!("failed to connect to {}", self.conn.addr()))?;
        debug!("Connected to {} as {}", self.conn.addr(), client.client_id());

        let mut published = 0usize;
        match &self.message {
            Some(message) => {
                client.publish(&self.topic, message.clone()).await?;
                published += 1;
            }
            None => {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
                    client.publish(&self.topic, line).await?;
                    published += 1;
                }
            }
        }

        info!("Published {} message(s) to {}", published, self.topic);
        client.disconnect().await?;
        Ok(())
    }
}
