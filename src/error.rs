//! Error types for nas-remote

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Handshake timeout: no WebSocket upgrade within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Authentication timeout: no login response within {0:?}")]
    AuthTimeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Request timeout: {method} got no response within {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The appliance answered with an error frame; the message is passed through as-is.
    #[error("{message}")]
    Remote { code: Option<String>, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// True for failures that a fresh connection attempt might cure.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Connect(_)
                | ClientError::HandshakeTimeout(_)
                | ClientError::AuthTimeout(_)
                | ClientError::NotConnected
        )
    }
}
