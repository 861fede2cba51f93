//! Publisher-facing listener.
//!
//! The game-logic service sends one authenticated envelope per line and gets
//! one ack line back per envelope. Bad frames and bad secrets are answered
//! and dropped without closing the connection, until too many consecutive
//! auth failures pile up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tuicub_core::security::is_well_formed_token;
use tuicub_core::{Ack, Event, PublisherMessage, RelayError};
use tuicub_telemetry::RelayMetrics;

use crate::auth::{Authenticator, FailureBudget, SessionDirectory, SessionGrant};
use crate::codec::{self, FrameCodec, Inbound};
use crate::registry::Registry;
use crate::router::TopicRouter;

const ACK_QUEUE_CAPACITY: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub max_frame_len: usize,
    pub max_auth_failures: u32,
    /// Upper bound on writing one ack.
    pub write_timeout: Duration,
}

pub struct PublisherListener {
    router: TopicRouter,
    registry: Arc<Registry>,
    directory: Arc<SessionDirectory>,
    auth: Arc<Authenticator>,
    metrics: Arc<RelayMetrics>,
    config: PublisherConfig,
}

impl PublisherListener {
    pub fn new(
        router: TopicRouter,
        registry: Arc<Registry>,
        directory: Arc<SessionDirectory>,
        auth: Arc<Authenticator>,
        metrics: Arc<RelayMetrics>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            router,
            registry,
            directory,
            auth,
            metrics,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move { this.handle(stream, peer, shutdown).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "publisher accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        debug!("publisher listener stopped");
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, FrameCodec::new(self.config.max_frame_len));
        let writer = FramedWrite::new(write, FrameCodec::new(self.config.max_frame_len));

        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);
        let ack_task = tokio::spawn(ack_loop(
            writer,
            ack_rx,
            shutdown.clone(),
            self.config.write_timeout,
        ));
        let mut failures = FailureBudget::new(self.config.max_auth_failures);
        info!(peer = %peer, "publisher connected");

        loop {
            let ack = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = reader.next() => match line {
                    None => break,
                    Some(Ok(Inbound::Line(line))) if line.trim().is_empty() => continue,
                    Some(Ok(Inbound::Line(line))) => self.handle_line(&line, &mut failures),
                    Some(Ok(Inbound::Oversized)) => {
                        self.metrics.malformed_frame();
                        warn!(peer = %peer, "publisher frame too long");
                        Ack::rejected("malformed_frame")
                    }
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "publisher read failed");
                        break;
                    }
                },
            };

            // Acks are best effort; a publisher that stops reading loses them.
            if ack_tx.try_send(ack).is_err() {
                debug!(peer = %peer, "publisher ack queue full, ack dropped");
            }

            if failures.is_exhausted() {
                warn!(peer = %peer, "too many authentication failures, closing publisher");
                break;
            }
        }

        drop(ack_tx);
        let _ = ack_task.await;
        info!(peer = %peer, "publisher disconnected");
    }

    /// Decode, authenticate and dispatch one envelope.
    pub fn handle_line(&self, line: &str, failures: &mut FailureBudget) -> Ack {
        let envelope = match codec::decode_envelope(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.malformed_frame();
                warn!(error = %e, "malformed publisher frame");
                return Ack::rejected(e.kind());
            }
        };

        if let Err(e) = self.auth.authenticate_publisher(&envelope.token) {
            self.metrics.auth_rejected();
            failures.record_failure();
            warn!(op = envelope.message.op(), error = %e, "publisher authentication failed");
            return Ack::rejected(e.kind());
        }
        failures.record_success();

        match self.dispatch(envelope.message) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "publisher request rejected");
                Ack::rejected(e.kind())
            }
        }
    }

    fn dispatch(&self, message: PublisherMessage) -> Result<Ack, RelayError> {
        match message {
            PublisherMessage::Publish { topic, name, data } => {
                let outcome = self.router.publish(&topic, &Event::new(name, data))?;
                Ok(Ack::delivered(outcome.delivered))
            }
            PublisherMessage::OpenSession {
                token,
                session_id,
                topics,
            } => {
                if !is_well_formed_token(&token) {
                    return Err(RelayError::MalformedFrame("malformed session token".into()));
                }
                debug!(session_id = %session_id, "session opened");
                self.directory.open(token, SessionGrant { session_id, topics });
                Ok(Ack::ok())
            }
            PublisherMessage::CloseSession { token } => {
                self.directory.close(&token);
                Ok(Ack::ok())
            }
            PublisherMessage::Subscribe { session_id, topic } => {
                self.directory.add_topic(&session_id, &topic);
                let changed = self.registry.subscribe_session(&session_id, &topic);
                debug!(session_id = %session_id, topic = %topic, connections = changed, "session subscribed");
                Ok(Ack::ok())
            }
            PublisherMessage::Unsubscribe { session_id, topic } => {
                self.directory.remove_topic(&session_id, &topic);
                let changed = self.registry.unsubscribe_session(&session_id, &topic);
                debug!(session_id = %session_id, topic = %topic, connections = changed, "session unsubscribed");
                Ok(Ack::ok())
            }
        }
    }
}

/// Write acks in order until the queue closes, a write fails or stalls past
/// `write_timeout`, or the relay shuts down.
async fn ack_loop<W: AsyncWrite + Unpin>(
    mut writer: FramedWrite<W, FrameCodec>,
    mut acks: mpsc::Receiver<Ack>,
    shutdown: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let ack = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            ack = acks.recv() => match ack {
                Some(ack) => ack,
                None => break,
            },
        };
        let line = match codec::encode_ack(&ack) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode ack");
                continue;
            }
        };
        let written = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            written = tokio::time::timeout(write_timeout, writer.send(line)) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "publisher ack write failed");
                break;
            }
            Err(_) => {
                debug!("publisher ack write timed out");
                break;
            }
        }
    }
    drop(writer);
}
