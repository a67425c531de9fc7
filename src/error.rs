//! Error types for the forge fleet

use thiserror::Error;

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a fleet node
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error (listen/connect/close failures)
    #[error("network error: {0}")]
    Network(String),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// File transfer error
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Build pipeline error (clone/checkout/install/build/artifact discovery)
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Task lifecycle error
    #[error("task error: {0}")]
    Task(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Archive error
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}
