//! Topic to subscriber index shared by all connection handlers.
//!
//! Topics are matched exactly. Each subscriber is reached through its own
//! bounded outbound queue, so fan-out never waits on a slow peer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::types::Message;

/// Stable identifier of one accepted connection.
pub type ConnectionId = u64;

/// Delivery endpoint for one connection.
///
/// Cloning is cheap: the client id is shared and the sender is a handle.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    client_id: Arc<str>,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        client_id: impl Into<Arc<str>>,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            tx,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Ask the owning handler to close the connection.
    pub fn schedule_teardown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct Index {
    /// Topic -> subscribers keyed by connection id.
    topics: HashMap<String, HashMap<ConnectionId, ConnectionHandle>>,
    /// Connection -> topics it is subscribed to, for cleanup on disconnect.
    connections: HashMap<ConnectionId, HashSet<String>>,
}

/// Concurrent topic -> subscriber registry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    index: RwLock<Index>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handle` to the subscribers of `topic`.
    ///
    /// Returns `false` if it was already subscribed.
    pub fn subscribe(&self, handle: &ConnectionHandle, topic: &str) -> bool {
        let mut index = self.index.write();
        let added = index
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(handle.id, handle.clone())
            .is_none();
        index
            .connections
            .entry(handle.id)
            .or_default()
            .insert(topic.to_string());

        if added {
            debug!("Client {} subscribed to {}", handle.client_id, topic);
        }
        added
    }

    /// Remove connection `id` from `topic`. No-op when absent.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> bool {
        let mut index = self.index.write();
        let Index { topics, connections } = &mut *index;

        let removed = match topics.get_mut(topic) {
            Some(subscribers) => {
                let removed = subscribers.remove(&id).is_some();
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
                removed
            }
            None => false,
        };

        if let Some(subscribed) = connections.get_mut(&id) {
            subscribed.remove(topic);
            if subscribed.is_empty() {
                connections.remove(&id);
            }
        }

        if removed {
            debug!("Connection {} unsubscribed from {}", id, topic);
        }
        removed
    }

    /// Queue `message` for every current subscriber of its topic.
    ///
    /// The subscriber set is snapshotted first, so concurrent subscribe and
    /// unsubscribe calls never block delivery. A subscriber whose queue is
    /// full or closed is skipped and its connection is scheduled for
    /// teardown. Returns how many subscribers the message was queued for.
    pub fn publish(&self, message: &Message) -> usize {
        let subscribers: Vec<ConnectionHandle> = {
            let index = self.index.read();
            match index.topics.get(&message.topic) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for handle in subscribers {
            match handle.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Outbound queue full for {}, dropping message on {} and closing",
                        handle.client_id, message.topic
                    );
                    handle.schedule_teardown();
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Failed to send to {}: connection closed", handle.client_id);
                    handle.schedule_teardown();
                }
            }
        }

        trace!("Routed message on {} to {} subscribers", message.topic, delivered);
        delivered
    }

    /// Remove connection `id` from every topic. Returns the number of topics.
    pub fn remove_connection(&self, id: ConnectionId) -> usize {
        let mut index = self.index.write();
        let Index { topics, connections } = &mut *index;

        let Some(subscribed) = connections.remove(&id) else {
            return 0;
        };

        for topic in &subscribed {
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
        }

        debug!("Cleaned up {} subscriptions for connection {}", subscribed.len(), id);
        subscribed.len()
    }

    /// Connection ids currently subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        let index = self.index.read();
        index
            .topics
            .get(topic)
            .map(|subscribers| subscribers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Topics `id` is subscribed to.
    pub fn topics_of(&self, id: ConnectionId) -> Vec<String> {
        let index = self.index.read();
        index
            .connections
            .get(&id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.index.read().topics.len()
    }
}
