//! MQTT client.
//!
//! A single-connection client that drives the protocol from the opposite
//! role to [`Broker`](crate::Broker). Operations run one at a time through
//! `&mut self`; publishes that arrive while an acknowledgement is awaited
//! are buffered and returned by later [`Client::recv`] calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::broker::DEFAULT_PORT;
use crate::error::{Error, Result};
use crate::protocol::packet::create_connect;
use crate::protocol::{self, MAX_PACKET_SIZE, Packet, Publish, Subscribe, Unsubscribe};
use crate::types::{Message, PacketIdGenerator, PacketType, QoS};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client ID, 1 to 23 characters.
    pub client_id: String,
    /// QoS used for publishes and subscriptions.
    pub qos: QoS,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Send PINGREQ every `keep_alive / 2` seconds in the background.
    pub auto_keepalive: bool,
}

impl ClientConfig {
    /// Create a new client config.
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            qos: QoS::AtMostOnce,
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            max_packet_size: MAX_PACKET_SIZE,
            auto_keepalive: true,
        }
    }

    /// Config for a broker on localhost at the default port.
    pub fn local(client_id: impl Into<String>) -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT, client_id)
    }

    /// Set the QoS for publishes and subscriptions.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the maximum packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Enable or disable automatic keep-alive.
    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }

    /// Broker address as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// MQTT client.
pub struct Client {
    reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    read_buf: BytesMut,
    client_id: String,
    qos: QoS,
    max_packet_size: usize,
    packet_ids: PacketIdGenerator,
    /// Publishes sent and not yet acknowledged, by packet id.
    in_flight: HashMap<u16, Publish>,
    /// Publishes received while waiting for an acknowledgement.
    pending: VecDeque<Message>,
    keepalive: CancellationToken,
    /// Set once an error has torn the connection down.
    closed: bool,
}

impl Client {
    /// Connect to a broker and complete the CONNECT handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        debug!("Connecting to {} as {}", config.addr(), config.client_id);

        let connect = create_connect(
            &config.client_id,
            config.username.as_deref(),
            config.password.as_deref(),
            config.keep_alive,
            config.clean_session,
        )?;

        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("Failed to set TCP_NODELAY: {}", e);
        }
        let (mut reader, mut writer) = stream.into_split();

        protocol::write_packet(&mut writer, &connect).await?;

        let mut read_buf = BytesMut::with_capacity(1024);
        match protocol::read_packet(&mut reader, &mut read_buf, config.max_packet_size).await? {
            Packet::ConnAck(connack) => {
                if connack.return_code() != 0 {
                    return Err(Error::ConnectionRefused(connack.return_code()));
                }
                debug!("Connected, session_present={}", connack.session_present());
            }
            other => {
                return Err(Error::UnexpectedPacket {
                    expected: PacketType::ConnAck.to_string(),
                    got: other.packet_type().to_string(),
                });
            }
        }

        let writer = Arc::new(Mutex::new(writer));
        let keepalive = CancellationToken::new();

        if config.auto_keepalive && config.keep_alive > 0 {
            let interval = Duration::from_secs((config.keep_alive / 2).max(1) as u64);
            tokio::spawn(keepalive_task(Arc::clone(&writer), keepalive.clone(), interval));
            debug!("Started auto keepalive task (interval={:?})", interval);
        }

        Ok(Self {
            reader,
            writer,
            read_buf,
            client_id: config.client_id,
            qos: config.qos,
            max_packet_size: config.max_packet_size,
            packet_ids: PacketIdGenerator::new(),
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            keepalive,
            closed: false,
        })
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of publishes still awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Publish a message at the configured QoS.
    ///
    /// QoS 1 returns after the matching PUBACK, QoS 2 after PUBCOMP.
    /// Nothing is retransmitted.
    pub async fn publish(&mut self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let packet_id = self.packet_ids.next_id();
        let publish = Publish::new(topic, payload, packet_id)?.with_qos(self.qos);
        trace!("Publishing to {} ({} bytes, id={})", topic, publish.payload().len(), packet_id);

        let result = self.exchange(packet_id, publish).await;
        if result.is_err() {
            self.in_flight.remove(&packet_id);
        }
        self.check(result).await
    }

    /// Send `publish` and run its acknowledgement flow.
    async fn exchange(&mut self, packet_id: u16, publish: Publish) -> Result<()> {
        self.send(&Packet::Publish(publish.clone())).await?;

        match self.qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => {
                self.in_flight.insert(packet_id, publish);
                let acked = self.await_ack(PacketType::PubAck).await?;
                self.settle(PacketType::PubAck, acked)
            }
            QoS::ExactlyOnce => {
                self.in_flight.insert(packet_id, publish);
                let received = self.await_ack(PacketType::PubRec).await?;
                if !self.in_flight.contains_key(&received) {
                    return Err(unknown_id(PacketType::PubRec, received));
                }
                self.send(&Packet::PubRel(received)).await?;
                let completed = self.await_ack(PacketType::PubComp).await?;
                self.settle(PacketType::PubComp, completed)
            }
        }
    }

    /// Send a SUBSCRIBE for `topic` and return its packet id.
    pub async fn send_subscribe(&mut self, topic: &str) -> Result<u16> {
        self.ensure_open()?;
        let packet_id = self.packet_ids.next_id();
        let subscribe = Subscribe::new(packet_id, topic)?.with_qos(self.qos);
        debug!("Subscribing to {} with id={}", topic, packet_id);
        let result = self.send(&Packet::Subscribe(subscribe)).await;
        self.check(result).await?;
        Ok(packet_id)
    }

    /// Wait for the SUBACK answering the SUBSCRIBE `packet_id`.
    pub async fn await_suback(&mut self, topic: &str, packet_id: u16) -> Result<()> {
        self.ensure_open()?;
        let result = self.read_suback(topic, packet_id).await;
        self.check(result).await
    }

    async fn read_suback(&mut self, topic: &str, packet_id: u16) -> Result<()> {
        loop {
            match self.read().await? {
                Packet::SubAck(suback) => {
                    if suback.packet_id() != packet_id {
                        return Err(unknown_id(PacketType::SubAck, suback.packet_id()));
                    }
                    if !suback.is_success() {
                        return Err(Error::OperationFailed {
                            topic: topic.to_string(),
                            code: suback.return_code(),
                        });
                    }
                    debug!("Subscribed to {}", topic);
                    return Ok(());
                }
                Packet::Publish(publish) => self.pending.push_back(publish.into()),
                Packet::PingResp | Packet::UnsubAck(_) => {}
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "expected SUBACK, got {}",
                        other.packet_type()
                    )));
                }
            }
        }
    }

    /// Subscribe to `topic` and wait for the broker to accept it.
    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let packet_id = self.send_subscribe(topic).await?;
        self.await_suback(topic, packet_id).await
    }

    /// Unsubscribe from topics.
    ///
    /// The UNSUBACK is not awaited; later reads skip it.
    pub async fn unsubscribe(&mut self, topics: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let packet_id = self.packet_ids.next_id();
        let unsubscribe = Unsubscribe::new(packet_id).with_topics(topics.iter().copied())?;
        debug!("Unsubscribing from {:?} with id={}", topics, packet_id);
        let result = self.send(&Packet::Unsubscribe(unsubscribe)).await;
        self.check(result).await
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Result<Message> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        self.ensure_open()?;
        let result = self.next_message().await;
        self.check(result).await
    }

    async fn next_message(&mut self) -> Result<Message> {
        loop {
            match self.read().await? {
                Packet::Publish(publish) => {
                    trace!("Received message on {}", publish.topic());
                    return Ok(publish.into());
                }
                Packet::PingResp | Packet::UnsubAck(_) => continue,
                Packet::Disconnect => return Err(Error::ConnectionClosed),
                other => {
                    trace!("Ignoring {}", other.packet_type());
                    continue;
                }
            }
        }
    }

    /// Receive a message with timeout. `Ok(None)` means nothing arrived.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send a ping request.
    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_open()?;
        trace!("Sending PingReq");
        let result = self.send(&Packet::PingReq).await;
        self.check(result).await
    }

    /// Send DISCONNECT and close the connection.
    ///
    /// A connection already torn down by an earlier error is left as is.
    pub async fn disconnect(self) -> Result<()> {
        debug!("Disconnecting {}", self.client_id);
        self.keepalive.cancel();
        if self.closed {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        protocol::write_packet(&mut *writer, &Packet::Disconnect).await?;
        writer.shutdown().await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Pass `result` through, tearing the connection down first when its
    /// error leaves the stream unusable.
    async fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            if breaks_connection(e) {
                self.teardown(e).await;
            }
        }
        result
    }

    async fn teardown(&mut self, cause: &Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        warn!("Closing connection of {}: {}", self.client_id, cause);

        self.keepalive.cancel();
        self.in_flight.clear();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!("Shutdown after error failed: {}", e);
        }
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        protocol::write_packet(&mut *writer, packet).await
    }

    async fn read(&mut self) -> Result<Packet> {
        protocol::read_packet(&mut self.reader, &mut self.read_buf, self.max_packet_size).await
    }

    /// Read until the acknowledgement of type `expected` arrives, buffering
    /// publishes. Returns its packet id.
    async fn await_ack(&mut self, expected: PacketType) -> Result<u16> {
        loop {
            let packet = self.read().await?;
            match (expected, packet) {
                (PacketType::PubAck, Packet::PubAck(id))
                | (PacketType::PubRec, Packet::PubRec(id))
                | (PacketType::PubComp, Packet::PubComp(id)) => return Ok(id),
                (_, Packet::Publish(publish)) => self.pending.push_back(publish.into()),
                (_, Packet::PingResp) => trace!("Received PingResp"),
                (_, other) => {
                    return Err(Error::ProtocolViolation(format!(
                        "expected {}, got {}",
                        expected,
                        other.packet_type()
                    )));
                }
            }
        }
    }

    fn settle(&mut self, ack: PacketType, packet_id: u16) -> Result<()> {
        match self.in_flight.remove(&packet_id) {
            Some(_) => {
                trace!("Publish {} acknowledged by {}", packet_id, ack);
                Ok(())
            }
            None => Err(unknown_id(ack, packet_id)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.keepalive.cancel();
    }
}

/// Errors after which the byte stream can no longer be trusted.
fn breaks_connection(err: &Error) -> bool {
    matches!(
        err,
        Error::Io(_)
            | Error::InvalidMessageFormat(_)
            | Error::PacketTooLarge { .. }
            | Error::ProtocolViolation(_)
            | Error::UnexpectedPacket { .. }
            | Error::ConnectionClosed
    )
}

fn unknown_id(ack: PacketType, packet_id: u16) -> Error {
    Error::ProtocolViolation(format!("{ack} for unknown packet id {packet_id}"))
}

/// Background task for automatic keep-alive.
async fn keepalive_task(writer: Arc<Mutex<OwnedWriteHalf>>, cancel: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Keepalive task stopping");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let result = {
            let mut writer = writer.lock().await;
            protocol::write_packet(&mut *writer, &Packet::PingReq).await
        };

        if let Err(e) = result {
            warn!("Keepalive ping failed: {}", e);
            break;
        }

        trace!("Keepalive ping sent");
    }
}
