//! Error types for the chirp bridge

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the chirp bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio processing error
    #[error("audio error: {0}")]
    Audio(String),

    /// Satellite native-API protocol error
    #[error("device protocol error: {0}")]
    Device(String),

    /// Realtime session error
    #[error("realtime session error: {0}")]
    Realtime(String),

    /// Tool dispatch error
    #[error("tool error: {0}")]
    Tool(String),

    /// Device inventory error
    #[error("inventory error: {0}")]
    Inventory(String),

    /// Clip hosting error
    #[error("hosting error: {0}")]
    Hosting(String),

    /// Operation requires a live connection
    #[error("not connected")]
    NotConnected,

    /// A client task's channel closed (the task is gone)
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}
