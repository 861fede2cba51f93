use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
#[derive(Default)]
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of the relay counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub live_connections: i64,
    pub connections_accepted: u64,
    pub handshakes_rejected: u64,
    pub auth_rejected: u64,
    pub malformed_frames: u64,
    pub events_published: u64,
    pub events_delivered: u64,
    pub queue_overflows: u64,
    pub callbacks_delivered: u64,
    pub callbacks_dropped: u64,
}

/// Counters shared by every relay component.
#[derive(Default)]
pub struct RelayMetrics {
    live_connections: Gauge,
    connections_accepted: Counter,
    handshakes_rejected: Counter,
    auth_rejected: Counter,
    malformed_frames: Counter,
    events_published: Counter,
    events_delivered: Counter,
    queue_overflows: Counter,
    callbacks_delivered: Counter,
    callbacks_dropped: Counter,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.increment(1);
        self.live_connections.add(1);
    }

    pub fn connection_closed(&self) {
        self.live_connections.add(-1);
    }

    pub fn handshake_rejected(&self) {
        self.handshakes_rejected.increment(1);
    }

    pub fn auth_rejected(&self) {
        self.auth_rejected.increment(1);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.increment(1);
    }

    pub fn event_published(&self, delivered: usize) {
        self.events_published.increment(1);
        self.events_delivered.increment(delivered as u64);
    }

    pub fn queue_overflow(&self) {
        self.queue_overflows.increment(1);
    }

    pub fn callback_delivered(&self) {
        self.callbacks_delivered.increment(1);
    }

    pub fn callback_dropped(&self) {
        self.callbacks_dropped.increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            live_connections: self.live_connections.get(),
            connections_accepted: self.connections_accepted.get(),
            handshakes_rejected: self.handshakes_rejected.get(),
            auth_rejected: self.auth_rejected.get(),
            malformed_frames: self.malformed_frames.get(),
            events_published: self.events_published.get(),
            events_delivered: self.events_delivered.get(),
            queue_overflows: self.queue_overflows.get(),
            callbacks_delivered: self.callbacks_delivered.get(),
            callbacks_dropped: self.callbacks_dropped.get(),
        }
    }
}
