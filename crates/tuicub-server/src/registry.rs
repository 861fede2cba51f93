//! Connection registry.
//!
//! Single owner of every live client connection and of both subscription
//! views: connection → topics and topic → connections. One lock guards both,
//! so a publish never observes a half-applied subscribe or unregister.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tuicub_core::{ConnectionId, DisconnectReason, SessionId, Topic};
use tuicub_telemetry::RelayMetrics;

use crate::codec::OutboundFrame;
use crate::router::TopicIndex;

/// Cheap, cloneable reference to a registered connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    session_id: SessionId,
    last_activity: Arc<Mutex<Instant>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Record inbound or outbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Everything the connection's tasks need after a successful register.
pub struct Registration {
    pub handle: ConnectionHandle,
    /// Drained by the connection's send loop.
    pub outbound: mpsc::Receiver<OutboundFrame>,
    /// Cancelled exactly once, when the connection leaves the registry or the
    /// server shuts down.
    pub closed: CancellationToken,
}

/// Handed to the disconnect notifier once per unregistered connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub reason: DisconnectReason,
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    topics: HashSet<Topic>,
    tx: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    topics: TopicIndex,
}

#[derive(Debug, Default)]
pub(crate) struct FanOut {
    pub(crate) delivered: usize,
    pub(crate) overflowed: Vec<ConnectionId>,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    queue_capacity: usize,
    notices: mpsc::UnboundedSender<DisconnectNotice>,
    shutdown: CancellationToken,
    metrics: Arc<RelayMetrics>,
}

impl Registry {
    /// Create a registry whose connection tokens are children of `shutdown`.
    /// The returned receiver yields one notice per unregistered connection.
    pub fn new(
        queue_capacity: usize,
        metrics: Arc<RelayMetrics>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<DisconnectNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Mutex::new(RegistryInner::default()),
            queue_capacity: queue_capacity.max(1),
            notices,
            shutdown,
            metrics,
        };
        (registry, rx)
    }

    /// Add an authenticated connection. It is subscribed to `topics` plus its
    /// session's personal topic.
    pub fn register(
        &self,
        session_id: SessionId,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Registration {
        let id = ConnectionId::new();
        let (tx, outbound) = mpsc::channel(self.queue_capacity);
        let closed = self.shutdown.child_token();
        let handle = ConnectionHandle {
            id: id.clone(),
            session_id: session_id.clone(),
            last_activity: Arc::new(Mutex::new(Instant::now())),
        };

        let mut subscribed: HashSet<Topic> = topics.into_iter().collect();
        subscribed.insert(Topic::for_session(&session_id));
        let topic_count = subscribed.len();

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            for topic in &subscribed {
                inner.topics.insert(topic.clone(), id.clone());
            }
            inner.connections.insert(
                id.clone(),
                ConnectionEntry {
                    handle: handle.clone(),
                    topics: subscribed,
                    tx,
                    closed: closed.clone(),
                },
            );
        }

        self.metrics.connection_opened();
        info!(connection_id = %id, session_id = %session_id, topics = topic_count, "connection registered");

        Registration {
            handle,
            outbound,
            closed,
        }
    }

    /// Remove a connection from both views, cancel its token and queue its
    /// disconnect notice. Returns `false` if it was already gone; only the
    /// first caller for a given connection has any effect.
    pub fn unregister(&self, handle: &ConnectionHandle, reason: DisconnectReason) -> bool {
        self.remove(&handle.id, reason)
    }

    pub(crate) fn remove(&self, id: &ConnectionId, reason: DisconnectReason) -> bool {
        let entry = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(entry) = inner.connections.remove(id) else {
                return false;
            };
            for topic in &entry.topics {
                inner.topics.remove(topic, id);
            }
            entry
        };

        entry.closed.cancel();
        self.metrics.connection_closed();
        info!(
            connection_id = %id,
            session_id = %entry.handle.session_id,
            reason = %reason,
            "connection unregistered"
        );

        let notice = DisconnectNotice {
            connection_id: id.clone(),
            session_id: entry.handle.session_id.clone(),
            reason,
        };
        if self.notices.send(notice).is_err() {
            warn!(connection_id = %id, "disconnect notifier stopped, notice dropped");
        }
        true
    }

    /// Returns `true` if the subscription was added.
    pub fn subscribe(&self, handle: &ConnectionHandle, topic: Topic) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.connections.get_mut(&handle.id) else {
            return false;
        };
        if !entry.topics.insert(topic.clone()) {
            return false;
        }
        inner.topics.insert(topic, handle.id.clone());
        true
    }

    /// Returns `true` if the subscription existed. The personal topic cannot
    /// be removed.
    pub fn unsubscribe(&self, handle: &ConnectionHandle, topic: &Topic) -> bool {
        if *topic == Topic::for_session(&handle.session_id) {
            return false;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.connections.get_mut(&handle.id) else {
            return false;
        };
        if !entry.topics.remove(topic) {
            return false;
        }
        inner.topics.remove(topic, &handle.id);
        true
    }

    /// Subscribe every live connection of a session. Returns how many
    /// connections gained the topic.
    pub fn subscribe_session(&self, session_id: &SessionId, topic: &Topic) -> usize {
        let personal = Topic::for_session(session_id);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let ids: Vec<ConnectionId> = inner.topics.subscribers(&personal).cloned().collect();

        let mut changed = 0;
        for id in ids {
            if let Some(entry) = inner.connections.get_mut(&id) {
                if entry.topics.insert(topic.clone()) {
                    inner.topics.insert(topic.clone(), id);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Unsubscribe every live connection of a session. Returns how many
    /// connections lost the topic.
    pub fn unsubscribe_session(&self, session_id: &SessionId, topic: &Topic) -> usize {
        let personal = Topic::for_session(session_id);
        if *topic == personal {
            return 0;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let ids: Vec<ConnectionId> = inner.topics.subscribers(&personal).cloned().collect();

        let mut changed = 0;
        for id in ids {
            if let Some(entry) = inner.connections.get_mut(&id) {
                if entry.topics.remove(topic) {
                    inner.topics.remove(topic, &id);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Enqueue `frame` on every subscriber of `topic` without blocking.
    /// Connections whose queue is full are reported, not removed.
    pub(crate) fn fan_out(&self, topic: &Topic, frame: &OutboundFrame) -> FanOut {
        let inner = self.inner.lock();
        let mut out = FanOut::default();
        for id in inner.topics.subscribers(topic) {
            let Some(entry) = inner.connections.get(id) else {
                continue;
            };
            match entry.tx.try_send(Arc::clone(frame)) {
                Ok(()) => out.delivered += 1,
                Err(TrySendError::Full(_)) => out.overflowed.push(id.clone()),
                // Send loop already exited; its unregister is in flight.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        out
    }

    /// Connections idle for at least `max_idle`.
    pub fn idle_connections(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let inner = self.inner.lock();
        inner
            .connections
            .values()
            .filter(|entry| entry.handle.idle_for() >= max_idle)
            .map(|entry| entry.handle.id.clone())
            .collect()
    }

    pub fn contains(&self, handle: &ConnectionHandle) -> bool {
        self.inner.lock().connections.contains_key(&handle.id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.lock().topics.len()
    }

    pub fn subscribers(&self, topic: &Topic) -> Vec<ConnectionId> {
        self.inner.lock().topics.subscribers(topic).cloned().collect()
    }

    /// Topics of a live connection, sorted. `None` once it is unregistered.
    pub fn topics_of(&self, handle: &ConnectionHandle) -> Option<Vec<Topic>> {
        let inner = self.inner.lock();
        let entry = inner.connections.get(&handle.id)?;
        let mut topics: Vec<Topic> = entry.topics.iter().cloned().collect();
        topics.sort();
        Some(topics)
    }
}
