use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};
use tuicub_core::{ConnectionId, DisconnectReason, Event, RelayError, Topic};
use tuicub_telemetry::RelayMetrics;

use crate::codec::{self, OutboundFrame};
use crate::registry::Registry;

/// Topic → subscribed connections. Lives inside the registry lock so that it
/// can never disagree with the per-connection topic sets.
#[derive(Debug, Default)]
pub(crate) struct TopicIndex {
    subscribers: HashMap<Topic, HashSet<ConnectionId>>,
}

impl TopicIndex {
    pub(crate) fn insert(&mut self, topic: Topic, id: ConnectionId) -> bool {
        self.subscribers.entry(topic).or_default().insert(id)
    }

    /// Remove one subscription, dropping the topic once nobody is left on it.
    pub(crate) fn remove(&mut self, topic: &Topic, id: &ConnectionId) -> bool {
        let Some(ids) = self.subscribers.get_mut(topic) else {
            return false;
        };
        let removed = ids.remove(id);
        if ids.is_empty() {
            self.subscribers.remove(topic);
        }
        removed
    }

    pub(crate) fn subscribers(&self, topic: &Topic) -> impl Iterator<Item = &ConnectionId> {
        self.subscribers.get(topic).into_iter().flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// Result of a single publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Connections the event was enqueued for.
    pub delivered: usize,
    /// Connections dropped because their queue was full.
    pub overflowed: usize,
}

/// Fans events out to every connection subscribed to a topic.
///
/// Publishing never waits on a slow client: a full queue closes that one
/// connection with `QueueOverflow` and the other subscribers still receive
/// the event.
#[derive(Clone)]
pub struct TopicRouter {
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
}

impl TopicRouter {
    pub fn new(registry: Arc<Registry>, metrics: Arc<RelayMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn publish(&self, topic: &Topic, event: &Event) -> Result<PublishOutcome, RelayError> {
        let frame = codec::encode_event(event)?;
        Ok(self.publish_frame(topic, &frame))
    }

    pub fn publish_frame(&self, topic: &Topic, frame: &OutboundFrame) -> PublishOutcome {
        let fan_out = self.registry.fan_out(topic, frame);

        // Closed outside the registry lock; unregister takes it again.
        for id in &fan_out.overflowed {
            self.metrics.queue_overflow();
            let error = RelayError::QueueOverflow(id.clone());
            warn!(topic = %topic, error = %error, kind = error.kind(), "closing connection");
            self.registry.remove(id, DisconnectReason::QueueOverflow);
        }

        self.metrics.event_published(fan_out.delivered);
        debug!(
            topic = %topic,
            delivered = fan_out.delivered,
            overflowed = fan_out.overflowed.len(),
            "event published"
        );

        PublishOutcome {
            delivered: fan_out.delivered,
            overflowed: fan_out.overflowed.len(),
        }
    }
}
