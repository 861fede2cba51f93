//! Wire messages exchanged on the client and publisher ports, and the body of
//! the disconnect callback.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;
use crate::topic::Topic;

/// First frame a client sends after connecting.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    pub token: String,
}

/// A game event as delivered to clients: `{"name": ..., "data": ...}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// An authenticated publisher frame. `token` carries the shared-secret digest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub token: String,
    pub message: PublisherMessage,
}

/// Operations the game-logic service can request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PublisherMessage {
    /// Fan an event out to every subscriber of `topic`.
    Publish {
        topic: Topic,
        name: String,
        #[serde(default)]
        data: Value,
    },
    /// Grant a client session token and its initial topics.
    OpenSession {
        token: String,
        session_id: SessionId,
        #[serde(default)]
        topics: Vec<Topic>,
    },
    /// Revoke a session token. Live connections are left alone.
    CloseSession { token: String },
    /// Subscribe every live connection of a session to a topic.
    Subscribe { session_id: SessionId, topic: Topic },
    /// Unsubscribe every live connection of a session from a topic.
    Unsubscribe { session_id: SessionId, topic: Topic },
}

impl PublisherMessage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Publish { .. } => "publish",
            Self::OpenSession { .. } => "open_session",
            Self::CloseSession { .. } => "close_session",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Per-request reply written back on the publisher port.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            delivered: None,
            error: None,
        }
    }

    pub fn delivered(count: usize) -> Self {
        Self {
            ok: true,
            delivered: Some(count),
            error: None,
        }
    }

    pub fn rejected(kind: &str) -> Self {
        Self {
            ok: false,
            delivered: None,
            error: Some(kind.to_string()),
        }
    }
}

/// Why a client connection ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    ClientClosed,
    ReadError,
    WriteError,
    IdleTimeout,
    QueueOverflow,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::IdleTimeout => "idle_timeout",
            Self::QueueOverflow => "queue_overflow",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body of the disconnect callback.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectCallback {
    pub session_id: SessionId,
    pub reason: DisconnectReason,
}
