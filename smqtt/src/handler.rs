//! Broker side of one connection.
//!
//! A handler moves through three states:
//!
//! - `AwaitingConnect`: the first frame must be a valid CONNECT. Anything
//!   else closes the socket without a reply.
//! - `Connected`: frames are dispatched until DISCONNECT, an error, a
//!   keep-alive timeout or cancellation.
//! - `Closed`: subscriptions are removed and the socket is released.
//!
//! The registry cleanup lives in [`Session`]'s `Drop`, so it runs on every
//! exit path once the handshake has succeeded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::BrokerContext;
use crate::error::{Error, Result};
use crate::protocol::packet::{create_connack, create_suback};
use crate::protocol::{self, Connect, Packet, Publish};
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::types::{Message, PacketIdGenerator, QoS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    AwaitingConnect,
    Connected,
    Closed,
}

/// What woke the connected loop.
enum Event {
    Cancelled,
    KeepAliveExpired,
    Outbound(Option<Message>),
    Inbound(Result<Packet>),
}

/// Per-connection state that exists once CONNECT was accepted.
struct Session {
    handle: ConnectionHandle,
    context: Arc<BrokerContext>,
    packet_ids: PacketIdGenerator,
    keep_alive: u16,
}

impl Session {
    fn new(handle: ConnectionHandle, context: Arc<BrokerContext>, keep_alive: u16) -> Self {
        Self {
            handle,
            context,
            packet_ids: PacketIdGenerator::new(),
            keep_alive,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.context.registry.remove_connection(self.handle.id());

        if let Some(ref on_disconnect) = self.context.on_disconnect {
            on_disconnect(self.handle.client_id());
        }

        info!("Client {} disconnected", self.handle.client_id());
    }
}

/// Drives one accepted connection.
pub(crate) struct ConnectionHandler {
    id: ConnectionId,
    peer: SocketAddr,
    context: Arc<BrokerContext>,
    cancel: CancellationToken,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    state: ConnectionState,
}

impl ConnectionHandler {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        context: Arc<BrokerContext>,
        cancel: CancellationToken,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            id,
            peer,
            context,
            cancel,
            reader,
            writer,
            read_buf: BytesMut::with_capacity(4096),
            state: ConnectionState::AwaitingConnect,
        }
    }

    pub(crate) async fn run(mut self) {
        let connect = match self.await_connect().await {
            Ok(connect) => connect,
            Err(e) => {
                debug!("Closing connection {} from {} before CONNECT: {}", self.id, self.peer, e);
                self.close().await;
                return;
            }
        };

        // The session and its callbacks only exist once the client has its CONNACK.
        if let Err(e) = self.send(&create_connack()).await {
            debug!("Failed to send CONNACK to {}: {}", connect.client_id(), e);
            self.close().await;
            return;
        }

        let (tx, rx) = mpsc::channel(self.context.outbound_queue);
        let handle = ConnectionHandle::new(self.id, connect.client_id(), tx, self.cancel.clone());
        let mut session = Session::new(handle, Arc::clone(&self.context), connect.keep_alive());
        self.state = ConnectionState::Connected;

        info!(
            "Client {} connected from {}, keep_alive={}s",
            connect.client_id(),
            self.peer,
            connect.keep_alive()
        );

        if let Some(ref on_connect) = self.context.on_connect {
            on_connect(session.handle.client_id());
        }
        let result = self.serve(&mut session, rx).await;

        match result {
            Ok(()) => {}
            Err(Error::ConnectionClosed) => {
                debug!("Client {} closed the connection", session.handle.client_id());
            }
            Err(Error::Cancelled) => {
                debug!("Connection {} cancelled while writing to {}", self.id, session.handle.client_id());
            }
            Err(Error::Io(e)) => {
                debug!("Client {} transport failure: {}", session.handle.client_id(), e);
            }
            Err(e @ (Error::InvalidMessageFormat(_) | Error::PacketTooLarge { .. })) => {
                warn!("Malformed frame from {}: {}", session.handle.client_id(), e);
            }
            Err(e) => {
                warn!("Closing {}: {}", session.handle.client_id(), e);
            }
        }

        drop(session);
        self.close().await;
    }

    /// Wait for the first frame, which must be a CONNECT.
    async fn await_connect(&mut self) -> Result<Connect> {
        let read = protocol::read_packet(&mut self.reader, &mut self.read_buf, self.context.max_packet_size);

        let packet = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::ConnectionClosed),
            result = tokio::time::timeout(self.context.connect_timeout, read) => {
                result.map_err(|_| Error::Timeout("waiting for CONNECT".to_string()))??
            }
        };

        match packet {
            Packet::Connect(connect) => Ok(connect),
            other => Err(Error::ProtocolViolation(format!(
                "expected CONNECT, got {}",
                other.packet_type()
            ))),
        }
    }

    async fn serve(&mut self, session: &mut Session, mut rx: mpsc::Receiver<Message>) -> Result<()> {
        // Disconnect if no packet arrives within 1.5x keep_alive. Zero disables it.
        let keep_alive = (self.context.enforce_keep_alive && session.keep_alive > 0)
            .then(|| Duration::from_millis(session.keep_alive as u64 * 1500));
        let mut deadline = keep_alive.map(|d| Instant::now() + d);

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Cancelled,
                _ = expire(deadline) => Event::KeepAliveExpired,
                msg = rx.recv() => Event::Outbound(msg),
                result = protocol::read_packet(&mut self.reader, &mut self.read_buf, self.context.max_packet_size) => {
                    Event::Inbound(result)
                }
            };

            match event {
                Event::Cancelled => {
                    debug!("Connection {} cancelled", self.id);
                    return Ok(());
                }
                Event::KeepAliveExpired => {
                    warn!(
                        "Client {} keep-alive timeout ({}s), disconnecting",
                        session.handle.client_id(),
                        session.keep_alive
                    );
                    return Err(Error::Timeout("keep-alive".to_string()));
                }
                // The session holds a sender, so the queue only ends with the session.
                Event::Outbound(None) => return Ok(()),
                Event::Outbound(Some(msg)) => self.deliver(session, msg).await?,
                Event::Inbound(result) => {
                    let packet = result?;
                    if let Some(d) = keep_alive {
                        deadline = Some(Instant::now() + d);
                    }
                    if !self.dispatch(session, packet).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handle one inbound frame. Returns `false` when the client disconnected.
    async fn dispatch(&mut self, session: &mut Session, packet: Packet) -> Result<bool> {
        let client_id = session.handle.client_id();

        match packet {
            Packet::Publish(publish) => {
                let (qos, packet_id) = (publish.qos(), publish.packet_id());
                let message = Message::from(publish);
                let delivered = self.context.registry.publish(&message);
                debug!(
                    "Client {} published to {} ({} bytes, {} subscribers)",
                    client_id,
                    message.topic,
                    message.payload.len(),
                    delivered
                );

                match qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => self.send(&Packet::PubAck(packet_id)).await?,
                    QoS::ExactlyOnce => self.send(&Packet::PubRec(packet_id)).await?,
                }
            }
            Packet::PubRel(packet_id) => {
                self.send(&Packet::PubComp(packet_id)).await?;
            }
            Packet::Subscribe(subscribe) => {
                self.context.registry.subscribe(&session.handle, subscribe.topic());
                self.send(&create_suback(subscribe.packet_id(), 0)).await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                for topic in unsubscribe.topics() {
                    self.context.registry.unsubscribe(self.id, topic);
                }
                self.send(&Packet::UnsubAck(unsubscribe.packet_id())).await?;
            }
            Packet::PingReq => {
                trace!("PingReq from {}", client_id);
                self.send(&Packet::PingResp).await?;
            }
            Packet::Disconnect => {
                debug!("Client {} sent DISCONNECT", client_id);
                return Ok(false);
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected {} from connected client",
                    other.packet_type()
                )));
            }
        }

        Ok(true)
    }

    /// Write a fanned-out message to this connection.
    async fn deliver(&mut self, session: &mut Session, msg: Message) -> Result<()> {
        let publish = Publish::new(msg.topic, msg.payload, session.packet_ids.next_id())?
            .with_retain(msg.retain);
        self.send(&Packet::Publish(publish)).await
    }

    /// Write one frame. A peer that stops reading can block the write, so
    /// cancellation is checked alongside it.
    async fn send(&mut self, packet: &Packet) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = protocol::write_packet(&mut self.writer, packet) => result,
        }
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        if let Err(e) = self.writer.shutdown().await {
            trace!("Shutdown of connection {} failed: {}", self.id, e);
        }
        self.cancel.cancel();
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
