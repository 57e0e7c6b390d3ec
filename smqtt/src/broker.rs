//! MQTT broker.
//!
//! Accepts TCP connections and runs one [`ConnectionHandler`] task per
//! connection. All handlers share a [`SubscriptionRegistry`]; topics are
//! matched exactly.
//!
//! ## Shutdown
//!
//! Every handler runs under a child of the broker's [`CancellationToken`].
//! [`Broker::shutdown`] cancels it, the accept loop stops, and `serve`
//! returns once every connection has released its socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handler::ConnectionHandler;
use crate::protocol::MAX_PACKET_SIZE;
use crate::registry::SubscriptionRegistry;
use crate::types::Message;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default depth of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 100;

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Broker configuration.
///
/// Can be loaded from YAML; missing keys take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Depth of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Seconds a new connection may take to send CONNECT.
    pub connect_timeout_secs: u64,
    /// Close connections that stay silent for 1.5x their keep-alive.
    pub enforce_keep_alive: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_packet_size: MAX_PACKET_SIZE,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            connect_timeout_secs: 10,
            enforce_keep_alive: true,
        }
    }
}

impl BrokerConfig {
    /// Create a new broker config.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the maximum packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the outbound queue depth per connection.
    pub fn with_outbound_queue(mut self, depth: usize) -> Self {
        self.outbound_queue = depth;
        self
    }

    /// Set how long a new connection may take to send CONNECT.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Enable or disable keep-alive enforcement.
    pub fn with_keep_alive_enforcement(mut self, enabled: bool) -> Self {
        self.enforce_keep_alive = enabled;
        self
    }

    /// Listen address as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the values a broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue == 0 {
            return Err(Error::InvalidConfig("outbound_queue must be at least 1".to_string()));
        }
        if self.max_packet_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_packet_size must be at least 2, got {}",
                self.max_packet_size
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::InvalidConfig("connect_timeout_secs must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Set the on_connect callback, called with the client id after CONNACK.
    pub fn on_connect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Set the on_disconnect callback, called after the connection's
    /// subscriptions have been removed.
    pub fn on_disconnect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        let context = BrokerContext {
            registry: Arc::new(SubscriptionRegistry::new()),
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            max_packet_size: self.config.max_packet_size,
            outbound_queue: self.config.outbound_queue,
            connect_timeout: Duration::from_secs(self.config.connect_timeout_secs),
            enforce_keep_alive: self.config.enforce_keep_alive,
        };

        Broker {
            config: self.config,
            context: Arc::new(context),
            shutdown: CancellationToken::new(),
            next_connection_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }
}

/// State shared by the accept loop and every connection handler.
pub(crate) struct BrokerContext {
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) on_connect: Option<Callback>,
    pub(crate) on_disconnect: Option<Callback>,
    pub(crate) max_packet_size: usize,
    pub(crate) outbound_queue: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) enforce_keep_alive: bool,
}

/// MQTT broker.
pub struct Broker {
    config: BrokerConfig,
    context: Arc<BrokerContext>,
    shutdown: CancellationToken,
    next_connection_id: AtomicU64,
    running: AtomicBool,
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        self.config.validate()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let local_addr = listener.local_addr()?;
        info!("Broker listening on {}", local_addr);

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.spawn_handler(&tracker, stream, addr),
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        drop(listener);
        tracker.close();
        info!("Broker shutting down, waiting for {} connections", tracker.len());
        tracker.wait().await;
        info!("Broker on {} stopped", local_addr);
        Ok(())
    }

    fn spawn_handler(&self, tracker: &TaskTracker, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        debug!("Accepted connection {} from {}", id, addr);

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let handler = ConnectionHandler::new(
            id,
            stream,
            addr,
            Arc::clone(&self.context),
            self.shutdown.child_token(),
        );
        tracker.spawn(handler.run());
    }

    /// Publish a message from the broker itself.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.context.registry.publish(&Message::new(topic, payload))
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops the broker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.context.registry
    }

    /// The broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}
