//! Error types for Starguard.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Starguard operations.
///
/// A rate-limited event is never an error; admission results are plain
/// return values. These variants cover misconfiguration and the I/O done
/// around the limiter.
#[derive(Error, Debug)]
pub enum StarguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit with zero capacity or a non-positive period
    #[error("Invalid limit: capacity {capacity} over {period:?}")]
    InvalidLimit { capacity: u32, period: Duration },

    /// Layered configuration loading errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Background work started outside a tokio runtime
    #[error("No tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// Chat platform message API errors
    #[error("Message API error: {0}")]
    Message(String),

    /// A replayed event that could not be decoded
    #[error("Invalid event on line {line}: {source}")]
    InvalidEvent {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Starguard operations.
pub type Result<T> = std::result::Result<T, StarguardError>;
