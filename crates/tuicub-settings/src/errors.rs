//! Why a relay settings file could not be used.

use thiserror::Error;

/// Settings failures. Every one of them aborts startup.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings path exists but could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON, or a field has the wrong type.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Parsed fine, but `RelaySettings::validate` refused a value.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
