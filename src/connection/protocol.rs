//! Appliance Wire Protocol
//!
//! Single responsibility: Encode and decode the JSON text frames exchanged with the appliance.
//!
//! # Wire Format
//!
//! Every frame is a JSON object tagged by its `msg` field.
//!
//! ## Outbound
//! ```text
//! { "msg": "connect", "version": "1", "support": ["1"] }
//! { "msg": "method", "id": "<id>", "method": "vm.query", "params": [...] }
//! { "msg": "ping" }
//! { "auth": { "api_key": "<key>" } }          // fallback login, untagged
//! ```
//!
//! ## Inbound
//! ```text
//! { "msg": "connected", "session": "<token>" }
//! { "msg": "result", "id": "<id>", "result": <any> }
//! { "msg": "error", "id": "<id>", "error": { "code": ..., "message": "..." } }
//! { "msg": "pong" }
//! { "msg": "failed", "version": "1" }
//! ```
//!
//! Any other `msg` value decodes to [`Inbound::Other`] and is ignored by the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// Protocol version offered in the connect frame.
pub const PROTOCOL_VERSION: &str = "1";

/// Versions we can speak.
pub const SUPPORTED_VERSIONS: &[&str] = &["1"];

/// A frame sent to the appliance.
#[derive(Debug, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum Outbound<'a> {
    Connect {
        version: &'a str,
        support: &'a [&'a str],
    },
    Method {
        id: &'a str,
        method: &'a str,
        params: &'a Value,
    },
    Ping,
}

impl<'a> Outbound<'a> {
    pub fn connect() -> Self {
        Outbound::Connect {
            version: PROTOCOL_VERSION,
            support: SUPPORTED_VERSIONS,
        }
    }

    pub fn encode(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The fallback login frame. The appliance never answers it with a correlated response.
#[derive(Debug, Serialize)]
pub struct FallbackAuth<'a> {
    pub auth: ApiKeyAuth<'a>,
}

#[derive(Debug, Serialize)]
pub struct ApiKeyAuth<'a> {
    pub api_key: &'a str,
}

pub fn encode_fallback_auth(api_key: &str) -> Result<String, ClientError> {
    Ok(serde_json::to_string(&FallbackAuth {
        auth: ApiKeyAuth { api_key },
    })?)
}

/// A frame received from the appliance.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum Inbound {
    Connected {
        #[serde(default)]
        session: Option<String>,
    },
    Result {
        id: String,
        #[serde(default)]
        result: Value,
    },
    Error {
        id: String,
        #[serde(default)]
        error: RemoteFault,
    },
    Pong {
        #[serde(default)]
        id: Option<Value>,
    },
    Failed {
        #[serde(default)]
        version: Option<String>,
    },
    #[serde(other)]
    Other,
}

impl Inbound {
    /// Correlation id, for the variants that carry one.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Inbound::Result { id, .. } | Inbound::Error { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Error body of an `error` frame.
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
pub struct RemoteFault {
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default, alias = "reason")]
    pub message: Option<String>,
}

impl RemoteFault {
    pub fn into_error(self) -> ClientError {
        let code = self.code.map(|c| match c {
            Value::String(s) => s,
            other => other.to_string(),
        });
        ClientError::Remote {
            code,
            message: self
                .message
                .unwrap_or_else(|| "Unknown remote error".to_string()),
        }
    }
}

/// Decode a text frame.
pub fn decode(text: &str) -> Result<Inbound, ClientError> {
    serde_json::from_str(text).map_err(|e| ClientError::Protocol(format!("Malformed frame: {}", e)))
}
