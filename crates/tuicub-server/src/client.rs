//! Client-facing listener.
//!
//! Each accepted socket must present a session token as its first line. After
//! that the connection gets a reader (this task) and a send loop (spawned),
//! and the registry decides when it ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tuicub_core::{DisconnectReason, RelayError};
use tuicub_telemetry::RelayMetrics;

use crate::auth::{Authenticator, SessionGrant};
use crate::codec::{self, FrameCodec, Inbound, OutboundFrame};
use crate::registry::{ConnectionHandle, Registry};

/// Pause after a failed accept, so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_len: usize,
}

pub struct ClientListener {
    registry: Arc<Registry>,
    auth: Arc<Authenticator>,
    metrics: Arc<RelayMetrics>,
    config: ClientConfig,
}

impl ClientListener {
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<Authenticator>,
        metrics: Arc<RelayMetrics>,
        config: ClientConfig,
    ) -> Self {
        Self {
            registry,
            auth,
            metrics,
            config,
        }
    }

    /// Accept clients until `shutdown` fires.
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
                        warn!(error = %e, "client accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        debug!("client listener stopped");
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, FrameCodec::new(self.config.max_frame_len));

        let grant = match self.handshake(&mut reader, &shutdown).await {
            Ok(grant) => grant,
            Err(e) => {
                self.metrics.handshake_rejected();
                info!(peer = %peer, error = %e, "client handshake rejected");
                return;
            }
        };

        let registration = self.registry.register(grant.session_id, grant.topics);
        let handle = registration.handle;
        info!(peer = %peer, connection_id = %handle.id(), "client connected");

        let writer = FramedWrite::new(write, FrameCodec::new(self.config.max_frame_len));
        tokio::spawn(send_loop(
            writer,
            registration.outbound,
            handle.clone(),
            registration.closed.clone(),
            Arc::clone(&self.registry),
            self.config.write_timeout,
        ));

        read_loop(reader, &handle, &registration.closed, &self.registry).await;
    }

    async fn handshake(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
        shutdown: &CancellationToken,
    ) -> Result<SessionGrant, RelayError> {
        let first = tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(RelayError::ConnectionFault("server shutting down".into()))
            }
            first = tokio::time::timeout(self.config.handshake_timeout, reader.next()) => first,
        };
        let line = match first {
            Err(_) => return Err(RelayError::ConnectionFault("handshake timed out".into())),
            Ok(None) => {
                return Err(RelayError::ConnectionFault(
                    "closed before handshake".into(),
                ))
            }
            Ok(Some(Err(e))) => return Err(RelayError::ConnectionFault(e.to_string())),
            Ok(Some(Ok(Inbound::Oversized))) => {
                return Err(RelayError::MalformedFrame("oversized handshake".into()))
            }
            Ok(Some(Ok(Inbound::Line(line)))) => line,
        };
        let request = codec::decode_connect(&line)?;
        self.auth.authenticate_client(&request).await
    }
}

/// Any inbound line counts as keep-alive; clients send nothing else.
async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    handle: &ConnectionHandle,
    closed: &CancellationToken,
    registry: &Registry,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                registry.unregister(handle, DisconnectReason::Shutdown);
                break;
            }
            line = reader.next() => match line {
                Some(Ok(_)) => handle.touch(),
                Some(Err(e)) => {
                    debug!(connection_id = %handle.id(), error = %e, "client read failed");
                    registry.unregister(handle, DisconnectReason::ReadError);
                    break;
                }
                None => {
                    registry.unregister(handle, DisconnectReason::ClientClosed);
                    break;
                }
            },
        }
    }
}

/// Drain the outbound queue in order. Each write is bounded by
/// `write_timeout` and abandoned as soon as the connection is closed, so a
/// peer that stops reading cannot pin the task.
async fn send_loop(
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    handle: ConnectionHandle,
    closed: CancellationToken,
    registry: Arc<Registry>,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            written = tokio::time::timeout(write_timeout, writer.send(frame)) => written,
        };
        match written {
            Ok(Ok(())) => handle.touch(),
            Ok(Err(e)) => {
                debug!(connection_id = %handle.id(), error = %e, "client write failed");
                registry.unregister(&handle, DisconnectReason::WriteError);
                break;
            }
            Err(_) => {
                debug!(connection_id = %handle.id(), "client write timed out");
                registry.unregister(&handle, DisconnectReason::WriteError);
                break;
            }
        }
    }

    // No-op unless the root shutdown closed us first.
    registry.unregister(&handle, DisconnectReason::Shutdown);
    // Unflushed frames are dropped with the socket; a stalled peer would
    // block a final flush forever.
    drop(writer);
}

/// Periodically close connections idle for longer than `idle_timeout`.
pub fn start_idle_sweeper(
    registry: Arc<Registry>,
    idle_timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for id in registry.idle_connections(idle_timeout) {
                        info!(connection_id = %id, "closing idle connection");
                        registry.remove(&id, DisconnectReason::IdleTimeout);
                    }
                }
            }
        }
    })
}
