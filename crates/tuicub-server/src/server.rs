use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tuicub_core::{RelayError, SharedSecret};
use tuicub_settings::RelaySettings;
use tuicub_telemetry::RelayMetrics;

use crate::auth::{Authenticator, SessionDirectory};
use crate::client::{self, ClientConfig, ClientListener};
use crate::notifier::{CallbackTransport, DisconnectNotifier, NotifyOutcome, RetryPolicy};
use crate::publisher::{PublisherConfig, PublisherListener};
use crate::registry::Registry;
use crate::router::TopicRouter;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Client listener bind address, `host:port`.
    pub events_addr: String,
    /// Publisher listener bind address, `host:port`.
    pub messages_addr: String,
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_len: usize,
    pub publisher_secret: SharedSecret,
    pub max_auth_failures: u32,
    pub retry: RetryPolicy,
}

impl ServerConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let events = &settings.events;
        let messages = &settings.messages;
        Self {
            events_addr: format!("{}:{}", events.host, events.port),
            messages_addr: format!("{}:{}", messages.host, messages.port),
            queue_capacity: events.queue_capacity,
            idle_timeout: events.idle_timeout(),
            sweep_interval: events.sweep_interval(),
            handshake_timeout: events.handshake_timeout(),
            write_timeout: events.write_timeout(),
            max_frame_len: events.max_frame_len,
            publisher_secret: messages.secret.clone(),
            max_auth_failures: messages.max_auth_failures,
            retry: RetryPolicy::from(&settings.callback),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}

/// Bind both listeners and start every background task. Returns once the
/// relay is accepting connections.
pub async fn start(
    config: ServerConfig,
    transport: Arc<dyn CallbackTransport>,
    metrics: Arc<RelayMetrics>,
) -> Result<ServerHandle, RelayError> {
    let events_listener = TcpListener::bind(&config.events_addr).await?;
    let messages_listener = TcpListener::bind(&config.messages_addr).await?;
    let events_addr = events_listener.local_addr()?;
    let messages_addr = messages_listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let (registry, notices) =
        Registry::new(config.queue_capacity, Arc::clone(&metrics), shutdown.clone());
    let registry = Arc::new(registry);

    let notifier = Arc::new(DisconnectNotifier::new(
        transport,
        config.retry.clone(),
        Arc::clone(&metrics),
    ));
    let notifier_task = Arc::clone(&notifier).spawn(notices);

    let directory = Arc::new(SessionDirectory::new());
    let auth = Arc::new(Authenticator::new(
        directory.clone(),
        config.publisher_secret.clone(),
    ));

    let clients = Arc::new(ClientListener::new(
        Arc::clone(&registry),
        Arc::clone(&auth),
        Arc::clone(&metrics),
        ClientConfig {
            handshake_timeout: config.handshake_timeout,
            write_timeout: config.write_timeout,
            max_frame_len: config.max_frame_len,
        },
    ));
    let publishers = Arc::new(PublisherListener::new(
        TopicRouter::new(Arc::clone(&registry), Arc::clone(&metrics)),
        Arc::clone(&registry),
        Arc::clone(&directory),
        auth,
        Arc::clone(&metrics),
        PublisherConfig {
            max_frame_len: config.max_frame_len,
            max_auth_failures: config.max_auth_failures,
            write_timeout: config.write_timeout,
        },
    ));

    let tasks = vec![
        tokio::spawn(clients.run(events_listener, shutdown.clone())),
        tokio::spawn(publishers.run(messages_listener, shutdown.clone())),
        client::start_idle_sweeper(
            Arc::clone(&registry),
            config.idle_timeout,
            config.sweep_interval,
            shutdown.clone(),
        ),
    ];

    info!(events = %events_addr, messages = %messages_addr, "relay started");

    Ok(ServerHandle {
        events_addr,
        messages_addr,
        registry,
        directory,
        notifier,
        metrics,
        shutdown,
        tasks,
        notifier_task,
    })
}

/// Handle returned by `start()`. Dropping it does not stop the relay; call
/// `shutdown()` or `join()`.
pub struct ServerHandle {
    events_addr: SocketAddr,
    messages_addr: SocketAddr,
    registry: Arc<Registry>,
    directory: Arc<SessionDirectory>,
    notifier: Arc<DisconnectNotifier>,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    notifier_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn events_addr(&self) -> SocketAddr {
        self.events_addr
    }

    pub fn messages_addr(&self) -> SocketAddr {
        self.messages_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn router(&self) -> TopicRouter {
        TopicRouter::new(Arc::clone(&self.registry), Arc::clone(&self.metrics))
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<NotifyOutcome> {
        self.notifier.subscribe()
    }

    /// Stop accepting and close every connection with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shut down and wait for the listeners, then for the disconnect
    /// notices still being delivered.
    pub async fn join(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        drop(self.registry);
        let _ = self.notifier_task.await;
        info!("relay stopped");
    }
}
