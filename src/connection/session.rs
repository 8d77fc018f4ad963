//! Appliance Session
//!
//! Single responsibility: An authenticated, ready-to-use connection to the appliance.
//!
//! # The Key Abstraction
//!
//! A `Session` is produced in two steps:
//! 1. [`Session::open`] connects the WebSocket, sends the connect frame, waits the
//!    settle delay and returns a [`Handshake`]
//! 2. [`Handshake::authenticate`] logs in and only THEN returns a `Session`
//!
//! [`Session::establish`] runs both. A `Session` value has been authenticated;
//! it stops being ready when the socket closes, and never comes back. Use
//! `Client` for reconnection.
//!
//! # Inbound Routing
//!
//! The receive loop runs in its own task. Where a frame goes depends on the
//! session's current [`Route`]: while a login exchange is outstanding the login
//! listener sees `result`/`error`/`failed` frames first; otherwise `result` and
//! `error` frames go to the [`Multiplexer`].

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, trace, warn};

use super::auth::{self, AuthMethod};
use super::multiplexer::Multiplexer;
use super::protocol::{self, Inbound, Outbound, RemoteFault};
use super::transport::{Transport, WsSink, WsStream};
use crate::config::ClientConfig;
use crate::error::ClientError;

/// Which component receives correlated inbound frames.
pub(super) enum Route {
    /// Connect frame sent, login not started
    Handshake,
    /// Login outstanding; the first result/error/failed frame goes to `reply`
    Authenticating {
        id: String,
        reply: Option<oneshot::Sender<AuthReply>>,
    },
    /// Everything goes to the multiplexer
    Ready,
}

/// A frame handed to the login listener.
#[derive(Debug)]
pub(super) enum AuthReply {
    Result { id: String, result: Value },
    Error { id: String, fault: RemoteFault },
    Failed,
}

/// State shared between the session handle, its receive loop and its keepalive task.
pub(super) struct Shared {
    sink: Mutex<WsSink>,
    pub(super) mux: Multiplexer,
    pub(super) route: Mutex<Route>,
    open: AtomicBool,
    pub(super) authenticated: AtomicBool,
    intentional_close: AtomicBool,
    peer_session: Mutex<Option<String>>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn new(sink: WsSink) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            sink: Mutex::new(sink),
            mux: Multiplexer::new(),
            route: Mutex::new(Route::Handshake),
            open: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
            intentional_close: AtomicBool::new(false),
            peer_session: Mutex::new(None),
            closed,
        }
    }

    pub(super) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Write a text frame. Fails with `NotConnected` once the socket is closed.
    pub(super) async fn send_text(&self, text: String) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        trace!(frame = %text, "Sending frame");
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Connect(format!("Failed to send: {}", e)))
    }

    /// Route one inbound text frame. Never fails; bad frames are logged and dropped.
    async fn dispatch(&self, text: &str) {
        let inbound = match protocol::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        let inbound = match inbound {
            Inbound::Connected { session } => {
                debug!(session = ?session, "Peer accepted connect frame");
                *self.peer_session.lock().await = session;
                return;
            }
            Inbound::Pong { .. } => {
                trace!("Received pong");
                return;
            }
            Inbound::Other => {
                debug!("Ignoring unknown control frame");
                return;
            }
            other => other,
        };
        trace!(id = ?inbound.correlation_id(), "Routing frame");

        {
            let mut route = self.route.lock().await;
            if let Route::Authenticating { id, reply } = &mut *route {
                if let Some(tx) = reply.take() {
                    trace!(login_id = %id, "Handing frame to login listener");
                    let _ = tx.send(match inbound {
                        Inbound::Result { id, result } => AuthReply::Result { id, result },
                        Inbound::Error { id, error } => AuthReply::Error { id, fault: error },
                        _ => AuthReply::Failed,
                    });
                    return;
                }
            }
        }

        match inbound {
            Inbound::Result { id, result } => {
                self.mux.settle(&id, Ok(result)).await;
            }
            Inbound::Error { id, error } => {
                self.mux.settle(&id, Err(error.into_error())).await;
            }
            Inbound::Failed { version } => {
                warn!(version = ?version, "Peer sent a failure notice outside of login; ignoring");
            }
            _ => {}
        }
    }

    /// Tear down shared state after the socket is gone.
    async fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);

        // Drop a waiting login listener so the login fails now instead of timing out
        if let Route::Authenticating { reply, .. } = &mut *self.route.lock().await {
            reply.take();
        }

        let rejected = self.mux.reject_all(|| ClientError::NotConnected).await;
        if rejected > 0 {
            debug!(count = rejected, "Rejected pending requests on close");
        }
        self.closed.send_replace(true);
    }
}

/// An authenticated session with the appliance.
///
/// # Guarantees
///
/// If you have a `Session`, it completed the handshake and login. It is ready
/// for calls until:
/// - The appliance closes the connection
/// - A network error occurs
/// - The session is explicitly closed
///
/// Sessions do NOT reconnect. Use `Client` for that.
pub struct Session {
    url: String,
    shared: Arc<Shared>,
    request_timeout: Duration,
    auth_method: AuthMethod,
    recv_task: JoinHandle<()>,
    keepalive_task: Option<JoinHandle<()>>,
}

/// A connected session that has not logged in yet.
pub struct Handshake {
    url: String,
    shared: Arc<Shared>,
    config: ClientConfig,
    recv_task: Option<JoinHandle<()>>,
}

impl Session {
    /// Open the socket and perform the connect handshake.
    ///
    /// # Errors
    /// - `Connect` if the socket cannot be opened or closes during the settle delay
    /// - `HandshakeTimeout` if the WebSocket upgrade does not complete in time
    pub async fn open(config: &ClientConfig) -> Result<Handshake, ClientError> {
        let url = config.endpoint.url()?.to_string();
        info!(url = %url, "Opening appliance session");

        let mut transport = Transport::connect(&config.endpoint, config.timing.handshake_timeout).await?;
        transport.send(Outbound::connect().encode()?).await?;

        let (sink, stream) = transport.split();
        let shared = Arc::new(Shared::new(sink));

        let shared_for_recv = Arc::clone(&shared);
        let recv_task = tokio::spawn(async move {
            receiver_loop(stream, shared_for_recv).await;
        });

        let handshake = Handshake {
            url,
            shared,
            config: config.clone(),
            recv_task: Some(recv_task),
        };

        // The peer accepts the connect frame implicitly; give it a moment
        tokio::time::sleep(config.timing.settle_delay).await;
        if !handshake.shared.is_open() {
            return Err(ClientError::Connect("Connection closed during handshake".into()));
        }

        debug!(url = %handshake.url, "Handshake complete");
        Ok(handshake)
    }

    /// Open, handshake and authenticate in one step.
    pub async fn establish(config: &ClientConfig) -> Result<Session, ClientError> {
        Session::open(config).await?.authenticate().await
    }

    /// Call a remote method on this session.
    ///
    /// # Errors
    /// - `NotConnected` if the socket is closed (the request is never registered)
    /// - `RequestTimeout` if no response arrives in time
    /// - `Remote` if the appliance answers with an error frame
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        if !self.shared.is_open() {
            return Err(ClientError::NotConnected);
        }

        let (id, rx) = self.shared.mux.register().await;
        debug!(id = %id, method = %method, "Calling remote method");

        let sent = match (Outbound::Method {
            id: &id,
            method,
            params: &params,
        })
        .encode()
        {
            Ok(text) => self.shared.send_text(text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.shared.mux.forget(&id).await;
            return Err(e);
        }

        self.shared.mux.wait(&id, rx, method, self.request_timeout).await
    }

    /// Close the session on purpose. Idempotent.
    ///
    /// Every pending call is rejected with `NotConnected`.
    pub async fn close(&self) {
        self.shared.intentional_close.store(true, Ordering::SeqCst);
        if self.shared.is_open() {
            info!(url = %self.url, "Closing appliance session");
            if let Err(e) = self.shared.sink.lock().await.close().await {
                debug!(error = %e, "Close frame not delivered");
            }
        }
        self.shared.mark_closed().await;
        if let Some(task) = &self.keepalive_task {
            task.abort();
        }
        self.recv_task.abort();
    }

    /// Socket open AND authenticated.
    pub fn is_ready(&self) -> bool {
        self.shared.is_open() && self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Whether `close()` was called on this session.
    pub fn closed_intentionally(&self) -> bool {
        self.shared.intentional_close.load(Ordering::SeqCst)
    }

    /// Resolves once the socket is closed, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    /// Session token from the peer's `connected` frame, if it sent one.
    pub async fn peer_session(&self) -> Option<String> {
        self.shared.peer_session.lock().await.clone()
    }

    pub async fn pending_requests(&self) -> usize {
        self.shared.mux.pending_count().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url)
            .field("auth_method", &self.auth_method)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.recv_task.abort();
        if let Some(task) = &self.keepalive_task {
            task.abort();
        }
        debug!(url = %self.url, "Session dropped, background tasks aborted");
    }
}

impl Handshake {
    /// Log in and turn this handshake into a ready `Session`.
    ///
    /// On failure the socket is closed and the error returned unchanged.
    pub async fn authenticate(mut self) -> Result<Session, ClientError> {
        let shared = Arc::clone(&self.shared);
        let timing = self.config.timing.clone();

        match auth::login(&shared, &self.config.api_key, &timing).await {
            Ok(auth_method) => {
                let recv_task = self
                    .recv_task
                    .take()
                    .ok_or_else(|| ClientError::Protocol("Receiver task missing".into()))?;
                let keepalive_task = timing
                    .keepalive_interval
                    .map(|every| spawn_keepalive(Arc::clone(&shared), every));

                info!(url = %self.url, auth = ?auth_method, "Appliance session established");
                Ok(Session {
                    url: std::mem::take(&mut self.url),
                    shared,
                    request_timeout: timing.request_timeout,
                    auth_method,
                    recv_task,
                    keepalive_task,
                })
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Login failed, closing socket");
                shared.intentional_close.store(true, Ordering::SeqCst);
                if shared.is_open() {
                    let _ = shared.sink.lock().await.close().await;
                }
                shared.mark_closed().await;
                Err(e)
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

/// Receiver loop - runs in a spawned task.
///
/// Reads frames until the socket closes, routing each through `Shared::dispatch`.
async fn receiver_loop(mut stream: WsStream, shared: Arc<Shared>) {
    debug!("Receiver loop started");

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => shared.dispatch(&text).await,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => shared.dispatch(&text).await,
                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "Appliance closed connection");
                break;
            }
            Ok(_) => {
                // Ping/pong handled by tungstenite
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    debug!("Receiver loop ended");
    shared.mark_closed().await;
}

fn spawn_keepalive(shared: Arc<Shared>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ping = match Outbound::Ping.encode() {
                Ok(ping) => ping,
                Err(_) => break,
            };
            if let Err(e) = shared.send_text(ping).await {
                debug!(error = %e, "Keepalive stopped");
                break;
            }
        }
    })
}
