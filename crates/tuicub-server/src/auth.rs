use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tuicub_core::security::is_well_formed_token;
use tuicub_core::{ConnectRequest, RelayError, SessionId, SharedSecret, Topic};

/// What a valid client token entitles its connection to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_id: SessionId,
    pub topics: Vec<Topic>,
}

/// Maps a client session token to its grant.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<SessionGrant>;
}

/// In-memory token table maintained by the publisher through `open_session`,
/// `close_session` and the session-wide subscribe operations.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    grants: DashMap<String, SessionGrant>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the grant for `token`.
    pub fn open(&self, token: impl Into<String>, grant: SessionGrant) {
        self.grants.insert(token.into(), grant);
    }

    pub fn close(&self, token: &str) -> bool {
        self.grants.remove(token).is_some()
    }

    /// Add `topic` to every grant of the session, so reconnects keep it.
    pub fn add_topic(&self, session_id: &SessionId, topic: &Topic) -> usize {
        let mut changed = 0;
        for mut grant in self.grants.iter_mut() {
            if grant.session_id == *session_id && !grant.topics.contains(topic) {
                grant.topics.push(topic.clone());
                changed += 1;
            }
        }
        changed
    }

    pub fn remove_topic(&self, session_id: &SessionId, topic: &Topic) -> usize {
        let mut changed = 0;
        for mut grant in self.grants.iter_mut() {
            if grant.session_id == *session_id {
                let before = grant.topics.len();
                grant.topics.retain(|t| t != topic);
                if grant.topics.len() != before {
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl SessionResolver for SessionDirectory {
    async fn resolve(&self, token: &str) -> Option<SessionGrant> {
        self.grants.get(token).map(|grant| grant.clone())
    }
}

/// Validates client handshakes and publisher envelopes.
pub struct Authenticator {
    resolver: Arc<dyn SessionResolver>,
    publisher_secret: SharedSecret,
}

impl Authenticator {
    pub fn new(resolver: Arc<dyn SessionResolver>, publisher_secret: SharedSecret) -> Self {
        Self {
            resolver,
            publisher_secret,
        }
    }

    /// Check a client handshake. A token outside the token alphabet is
    /// rejected before any lookup.
    pub async fn authenticate_client(
        &self,
        request: &ConnectRequest,
    ) -> Result<SessionGrant, RelayError> {
        if !is_well_formed_token(&request.token) {
            return Err(RelayError::AuthRejected("malformed session token".into()));
        }
        self.resolver
            .resolve(&request.token)
            .await
            .ok_or_else(|| RelayError::AuthRejected("unknown session token".into()))
    }

    /// Check the digest carried in a publisher envelope.
    pub fn authenticate_publisher(&self, digest: &str) -> Result<(), RelayError> {
        if self.publisher_secret.verify_digest(digest) {
            Ok(())
        } else {
            Err(RelayError::AuthRejected("invalid publisher secret".into()))
        }
    }
}

/// Consecutive authentication failures on one publisher connection.
#[derive(Debug)]
pub struct FailureBudget {
    consecutive: u32,
    limit: u32,
}

impl FailureBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
        }
    }

    /// Returns `true` once the limit is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.is_exhausted()
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.consecutive >= self.limit
    }
}
