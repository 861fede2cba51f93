//! Disconnect notifier.
//!
//! Tells the game API that a client connection went away. Each notice is
//! delivered by its own task with bounded retries, so a slow or failing
//! endpoint never holds up the relay. Every notice ends in exactly one
//! [`NotifyOutcome`], broadcast to whoever is listening.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use tuicub_core::messages::DisconnectCallback;
use tuicub_core::{ConnectionId, DisconnectReason, RelayError, SessionId, SharedSecret};
use tuicub_settings::CallbackSettings;
use tuicub_telemetry::RelayMetrics;

use crate::registry::DisconnectNotice;

const OUTCOME_CHANNEL_CAPACITY: usize = 256;
const CALLBACK_PATH: &str = "/gamerooms/disconnect";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("callback endpoint returned status {0}")]
    Status(u16),
}

impl CallbackError {
    /// Transport failures and server-side statuses are worth another try;
    /// a client error will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status(status) => *status >= 500 || *status == 408 || *status == 429,
        }
    }
}

impl From<reqwest::Error> for CallbackError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Delivers a single callback request.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn notify(&self, callback: &DisconnectCallback) -> Result<(), CallbackError>;
}

/// POSTs the callback as JSON to `{base_url}/gamerooms/disconnect`, with the
/// callback secret's digest as bearer token.
pub struct HttpCallbackTransport {
    client: reqwest::Client,
    url: String,
    bearer: String,
}

impl HttpCallbackTransport {
    pub fn new(
        base_url: &str,
        secret: &SharedSecret,
        timeout: Duration,
    ) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}{CALLBACK_PATH}", base_url.trim_end_matches('/')),
            bearer: secret.digest(),
        })
    }

    pub fn from_settings(settings: &CallbackSettings) -> Result<Self, CallbackError> {
        Self::new(
            &settings.base_url,
            &settings.secret,
            settings.request_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackTransport {
    async fn notify(&self, callback: &DisconnectCallback) -> Result<(), CallbackError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.bearer)
            .json(callback)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CallbackError::Status(status.as_u16()))
        }
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
        }
    }
}

impl From<&CallbackSettings> for RetryPolicy {
    fn from(settings: &CallbackSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
            jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped
    /// at `max_delay`, then spread by `± jitter_factor`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp_ms = self.base_delay.as_millis() as f64 * 2.0_f64.powi(retry.min(31) as i32);
        let capped = exp_ms.min(self.max_delay.as_millis() as f64);

        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Final result of one disconnect notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered {
        connection_id: ConnectionId,
        session_id: SessionId,
        reason: DisconnectReason,
        attempts: u32,
    },
    Dropped {
        connection_id: ConnectionId,
        session_id: SessionId,
        reason: DisconnectReason,
        attempts: u32,
        error: CallbackError,
    },
}

impl NotifyOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. } | Self::Dropped { attempts, .. } => *attempts,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::Delivered { connection_id, .. } | Self::Dropped { connection_id, .. } => {
                connection_id
            }
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// The relay-level error for a notice given up on.
    pub fn failure(&self) -> Option<RelayError> {
        match self {
            Self::Delivered { .. } => None,
            Self::Dropped {
                attempts, error, ..
            } => Some(RelayError::CallbackFailed(format!(
                "{error} after {attempts} attempt(s)"
            ))),
        }
    }
}

pub struct DisconnectNotifier {
    transport: Arc<dyn CallbackTransport>,
    policy: RetryPolicy,
    outcomes: broadcast::Sender<NotifyOutcome>,
    metrics: Arc<RelayMetrics>,
}

impl DisconnectNotifier {
    pub fn new(
        transport: Arc<dyn CallbackTransport>,
        policy: RetryPolicy,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            transport,
            policy,
            outcomes,
            metrics,
        }
    }

    /// Observe outcomes of notices delivered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NotifyOutcome> {
        self.outcomes.subscribe()
    }

    /// Consume notices until every sender is gone, then wait for the
    /// deliveries still in flight.
    pub fn spawn(self: Arc<Self>, mut notices: mpsc::UnboundedReceiver<DisconnectNotice>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let tracker = TaskTracker::new();
            while let Some(notice) = notices.recv().await {
                let notifier = Arc::clone(&self);
                tracker.spawn(async move {
                    notifier.deliver(notice).await;
                });
            }
            tracker.close();
            tracker.wait().await;
            debug!("disconnect notifier drained");
        })
    }

    pub async fn deliver(&self, notice: DisconnectNotice) -> NotifyOutcome {
        let callback = DisconnectCallback {
            session_id: notice.session_id.clone(),
            reason: notice.reason,
        };

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match self.transport.notify(&callback).await {
                Ok(()) => {
                    break NotifyOutcome::Delivered {
                        connection_id: notice.connection_id.clone(),
                        session_id: notice.session_id.clone(),
                        reason: notice.reason,
                        attempts,
                    };
                }
                Err(error) if error.is_retryable() && attempts < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempts - 1);
                    warn!(
                        connection_id = %notice.connection_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "disconnect callback failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    break NotifyOutcome::Dropped {
                        connection_id: notice.connection_id.clone(),
                        session_id: notice.session_id.clone(),
                        reason: notice.reason,
                        attempts,
                        error,
                    };
                }
            }
        };

        match &outcome {
            NotifyOutcome::Delivered { attempts, .. } => {
                self.metrics.callback_delivered();
                info!(
                    connection_id = %notice.connection_id,
                    session_id = %notice.session_id,
                    reason = %notice.reason,
                    attempts,
                    "disconnect callback delivered"
                );
            }
            NotifyOutcome::Dropped { .. } => {
                self.metrics.callback_dropped();
                if let Some(error) = outcome.failure() {
                    warn!(
                        connection_id = %notice.connection_id,
                        session_id = %notice.session_id,
                        reason = %notice.reason,
                        error = %error,
                        kind = error.kind(),
                        "disconnect callback dropped"
                    );
                }
            }
        }

        // No receivers is fine.
        let _ = self.outcomes.send(outcome.clone());
        outcome
    }
}
