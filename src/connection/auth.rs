//! Appliance Authentication
//!
//! Single responsibility: Log a freshly handshaken connection in with the API key.
//!
//! # Authentication Flow
//!
//! 1. **Primary login**
//!    - Send `auth.login_with_api_key` with the key as the only parameter
//!    - A `result` frame carrying `true` for our id means success
//!    - An `error` frame, any other result, or a frame for another id is a rejection
//!
//! 2. **Fallback login**
//!    - Some appliances answer the primary login with a bare `failed` frame
//!    - We then send `{"auth": {"api_key": ...}}`, which is never acknowledged
//!    - After a grace delay the session is treated as authenticated
//!
//! The fallback result is NOT verified by the peer. It is kept for compatibility
//! with older appliances and reported as [`AuthMethod::Unverified`].

use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::protocol::{encode_fallback_auth, Outbound};
use super::session::{AuthReply, Route, Shared};
use crate::config::Timing;
use crate::error::ClientError;

/// Remote method used for the primary login.
pub const LOGIN_METHOD: &str = "auth.login_with_api_key";

/// How the session got authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Peer confirmed the API key
    ApiKey,
    /// Fallback frame sent; peer never confirmed
    Unverified,
}

/// Run the login exchange on a handshaken connection.
///
/// Sets the session's authenticated flag on success.
///
/// # Errors
/// - `Auth` if the appliance rejects the key
/// - `AuthTimeout` if nothing applicable arrives within `timing.auth_timeout`
/// - `NotConnected` / `Connect` if the socket goes away mid-login
pub(super) async fn login(shared: &Shared, api_key: &str, timing: &Timing) -> Result<AuthMethod, ClientError> {
    let id = shared.mux.next_id();
    let (reply_tx, reply_rx) = oneshot::channel();
    *shared.route.lock().await = Route::Authenticating {
        id: id.clone(),
        reply: Some(reply_tx),
    };

    let outcome = exchange(shared, &id, api_key, reply_rx, timing).await;

    match outcome {
        Ok(method) => {
            shared.authenticated.store(true, Ordering::SeqCst);
            *shared.route.lock().await = Route::Ready;
            Ok(method)
        }
        Err(e) => {
            *shared.route.lock().await = Route::Handshake;
            Err(e)
        }
    }
}

async fn exchange(
    shared: &Shared,
    id: &str,
    api_key: &str,
    reply_rx: oneshot::Receiver<AuthReply>,
    timing: &Timing,
) -> Result<AuthMethod, ClientError> {
    debug!(id = %id, "Sending login");

    let params = json!([api_key]);
    let frame = Outbound::Method {
        id,
        method: LOGIN_METHOD,
        params: &params,
    }
    .encode()?;
    shared.send_text(frame).await?;

    let reply = match timeout(timing.auth_timeout, reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => {
            return Err(ClientError::Connect("Connection closed during login".into()));
        }
        Err(_) => return Err(ClientError::AuthTimeout(timing.auth_timeout)),
    };

    match reply {
        AuthReply::Result { id: got, result } if got == id => {
            if result == Value::Bool(true) {
                info!("Logged in with API key");
                Ok(AuthMethod::ApiKey)
            } else {
                Err(ClientError::Auth(format!("API key rejected (login returned {})", result)))
            }
        }
        AuthReply::Error { id: got, fault } if got == id => Err(ClientError::Auth(
            fault.message.unwrap_or_else(|| "Login failed".to_string()),
        )),
        AuthReply::Result { id: got, .. } | AuthReply::Error { id: got, .. } => Err(ClientError::Auth(
            format!("Unexpected response id {} during login (expected {})", got, id),
        )),
        AuthReply::Failed => fallback(shared, api_key, timing).await,
    }
}

async fn fallback(shared: &Shared, api_key: &str, timing: &Timing) -> Result<AuthMethod, ClientError> {
    warn!("Primary login answered with a failure notice, trying fallback login frame");
    shared.send_text(encode_fallback_auth(api_key)?).await?;

    tokio::time::sleep(timing.fallback_grace).await;
    if !shared.is_open() {
        return Err(ClientError::NotConnected);
    }

    warn!("Session treated as authenticated WITHOUT confirmation from the appliance (fallback login)");
    Ok(AuthMethod::Unverified)
}
