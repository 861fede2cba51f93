//! # tuicub-settings
//!
//! Settings for the relay are resolved from three layers, lowest priority
//! first:
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: JSON, every field optional
//! 3. **Environment variables**: `TUICUB_*` overrides
//!
//! ```no_run
//! use tuicub_settings::load_settings;
//!
//! let settings = load_settings(None).unwrap_or_default();
//! println!("events port: {}", settings.events.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, load_settings, load_settings_from_path, settings_path};
pub use types::*;
