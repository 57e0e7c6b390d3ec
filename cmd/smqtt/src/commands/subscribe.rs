//! Subscribe command.

use anyhow::Context;
use clap::Args;
use smqtt::Client;
use tracing::info;

use super::ConnectionArgs;

/// Subscribe to topics and print every message received.
#[derive(Args)]
pub struct SubscribeCommand {
    #[command(flatten)]
    conn: ConnectionArgs,

    /// Topic to subscribe to (repeatable)
    #[arg(short = 't', long = "topic", required = true)]
    topics: Vec<String>,

    /// QoS level
    #[arg(short = 'q', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: u8,

    /// Print the topic before each message
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl SubscribeCommand {
    pub async fn run(&self) -> anyhow::Result<()> {
        let config = self.conn.client_config(self.qos)?;
        let mut client = Client::connect(config)
            .await
            .with_context(|| format!("failed to connect to {}", self.conn.addr()))?;

        for topic in &self.topics {
            client
                .subscribe(topic)
                .await
                .with_context(|| format!("failed to subscribe to {topic}"))?;
            info!("Subscribed to {}", topic);
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                msg = client.recv() => {
                    let msg = msg.context("connection lost")?;
                    let payload = String::from_utf8_lossy(&msg.payload);
                    if self.verbose {
                        println!("{} {}", msg.topic, payload);
                    } else {
                        println!("{}", payload);
                    }
                }
            }
        }

        client.disconnect().await?;
        Ok(())
    }
}
