//! Settings types. Every struct is `#[serde(default)]`, so a settings file
//! only needs the fields it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tuicub_core::SharedSecret;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Client-facing listener.
    pub events: EventsSettings,
    /// Publisher-facing listener.
    pub messages: MessagesSettings,
    /// Disconnect callback to the game API.
    pub callback: CallbackSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.events.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "events.queue_capacity must be positive".into(),
            ));
        }
        for (name, ms) in [
            ("events.idle_timeout_ms", self.events.idle_timeout_ms),
            ("events.sweep_interval_ms", self.events.sweep_interval_ms),
            ("events.handshake_timeout_ms", self.events.handshake_timeout_ms),
            ("events.write_timeout_ms", self.events.write_timeout_ms),
        ] {
            if ms == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be positive")));
            }
        }
        if self.events.max_frame_len < 64 {
            return Err(SettingsError::InvalidValue(
                "events.max_frame_len must be at least 64 bytes".into(),
            ));
        }
        if self.callback.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "callback.max_attempts must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.callback.jitter_factor) {
            return Err(SettingsError::InvalidValue(
                "callback.jitter_factor must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EventsSettings {
    pub host: String,
    pub port: u16,
    /// Bounded outbound queue per client connection.
    pub queue_capacity: usize,
    /// Connections without activity for this long are closed.
    pub idle_timeout_ms: u64,
    /// How often idle connections are swept.
    pub sweep_interval_ms: u64,
    /// Time a client has to send its handshake.
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single socket write.
    pub write_timeout_ms: u64,
    /// Longest accepted line on either port.
    pub max_frame_len: usize,
}

impl Default for EventsSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 23432,
            queue_capacity: 256,
            idle_timeout_ms: 300_000,
            sweep_interval_ms: 30_000,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            max_frame_len: 64 * 1024,
        }
    }
}

impl EventsSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MessagesSettings {
    pub host: String,
    pub port: u16,
    /// Shared secret the game API authenticates its publish requests with.
    pub secret: SharedSecret,
    /// Consecutive auth failures after which a publisher connection is closed.
    pub max_auth_failures: u32,
}

impl Default for MessagesSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 23433,
            secret: SharedSecret::new("changeme"),
            max_auth_failures: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    /// Base URL of the game API.
    pub base_url: String,
    /// Secret presented as a bearer digest on every callback.
    pub secret: SharedSecret,
    /// Total attempts per notice, first try included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub request_timeout_ms: u64,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.tuicub.com".to_string(),
            secret: SharedSecret::new("changeme"),
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
            request_timeout_ms: 5_000,
        }
    }
}

impl CallbackSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
    /// Append logs to this file instead of stdout.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = RelaySettings::default();
        assert_eq!(settings.events.port, 23432);
        assert_eq!(settings.messages.port, 23433);
        assert_eq!(settings.events.queue_capacity, 256);
        assert_eq!(settings.messages.max_auth_failures, 5);
        assert_eq!(settings.callback.max_attempts, 3);
        assert_eq!(settings.callback.base_url, "https://api.tuicub.com");
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: RelaySettings = serde_json::from_str(
            r#"{"events": {"port": 9000}, "messages": {"secret": "s3cr3t"}}"#,
        )
        .unwrap();
        assert_eq!(settings.events.port, 9000);
        assert_eq!(settings.events.host, "0.0.0.0");
        assert!(settings
            .messages
            .secret
            .verify_digest(&tuicub_core::security::sha256_hex("s3cr3t")));
        assert_eq!(settings.messages.port, 23433);
    }

    #[test]
    fn duration_helpers() {
        let events = EventsSettings {
            idle_timeout_ms: 1500,
            ..Default::default()
        };
        assert_eq!(events.idle_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut settings = RelaySettings::default();
        settings.events.queue_capacity = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_durations() {
        let cases: [fn(&mut EventsSettings); 4] = [
            |e| e.idle_timeout_ms = 0,
            |e| e.sweep_interval_ms = 0,
            |e| e.handshake_timeout_ms = 0,
            |e| e.write_timeout_ms = 0,
        ];
        for zero in cases {
            let mut settings = RelaySettings::default();
            zero(&mut settings.events);
            let err = settings.validate().unwrap_err();
            assert!(err.to_string().contains("must be positive"), "{err}");
        }

        let settings: RelaySettings =
            serde_json::from_str(r#"{"events": {"sweep_interval_ms": 0}}"#).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("sweep_interval_ms")
        ));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut settings = RelaySettings::default();
        settings.callback.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let settings: RelaySettings =
            serde_json::from_str(r#"{"callback": {"secret": "do-not-print"}}"#).unwrap();
        let debug = format!("{settings:?}");
        assert!(!debug.contains("do-not-print"), "secret leaked: {debug}");
    }
}
