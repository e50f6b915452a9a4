//! Error types for the transport, the frame decoder and configuration.

use thiserror::Error;

/// Failure to establish or keep the live transport. Always recoverable: the
/// connection manager answers these by reconnecting.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Stream(err.to_string())
    }
}

/// A frame that could not be turned into a [`StreamMessage`](crate::types::StreamMessage).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not valid utf-8")]
    Utf8,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid url {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme {0:?} (expected ws or wss)")]
    Scheme(String),
}
