//! # tuicub-relay
//!
//! Event relay binary: loads settings, starts the client and publisher
//! listeners, and runs until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tuicub_server::{HttpCallbackTransport, ServerConfig};
use tuicub_settings::RelaySettings;
use tuicub_telemetry::TelemetryConfig;

/// How long in-flight disconnect callbacks get after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Real-time event relay for tuicub game rooms.
#[derive(Parser, Debug)]
#[command(name = "tuicub-relay", about = "Real-time event relay for tuicub")]
struct Cli {
    /// Settings file (default: $TUICUB_RELAY_CONFIG, else ./relay.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host the client listener binds.
    #[arg(long)]
    events_host: Option<String>,

    /// Port the client listener binds (0 for auto-assign).
    #[arg(long)]
    events_port: Option<u16>,

    /// Host the publisher listener binds.
    #[arg(long)]
    messages_host: Option<String>,

    /// Port the publisher listener binds (0 for auto-assign).
    #[arg(long)]
    messages_port: Option<u16>,

    /// Base URL of the game API receiving disconnect callbacks.
    #[arg(long)]
    api_url: Option<String>,
}

impl Cli {
    /// Command-line flags win over the file and the environment.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.events_host {
            settings.events.host = host.clone();
        }
        if let Some(port) = self.events_port {
            settings.events.port = port;
        }
        if let Some(host) = &self.messages_host {
            settings.messages.host = host.clone();
        }
        if let Some(port) = self.messages_port {
            settings.messages.port = port;
        }
        if let Some(url) = &self.api_url {
            settings.callback.base_url = url.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = tuicub_settings::load_settings(cli.config.as_deref())
        .context("failed to load settings")?;
    cli.apply(&mut settings);

    let telemetry = tuicub_telemetry::init_telemetry(TelemetryConfig::from(&settings.logging))
        .context("failed to initialize telemetry")?;
    let metrics = telemetry.metrics();

    let transport = HttpCallbackTransport::from_settings(&settings.callback)
        .context("failed to build callback client")?;
    tracing::info!(url = transport.url(), "disconnect callbacks enabled");

    let server = tuicub_server::start(
        ServerConfig::from_settings(&settings),
        Arc::new(transport),
        metrics,
    )
    .await
    .context("failed to start relay")?;

    tracing::info!(
        events = %server.events_addr(),
        messages = %server.messages_addr(),
        "tuicub relay ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    if tokio::time::timeout(SHUTDOWN_GRACE, server.join())
        .await
        .is_err()
    {
        tracing::warn!("shutdown grace period elapsed, abandoning pending callbacks");
    }

    drop(telemetry);
    Ok(())
}
