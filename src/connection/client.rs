//! Appliance Client with Automatic Reconnection
//!
//! Single responsibility: Keep a ready session available, reconnecting as needed.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Client                           │
//! │  - Exposes call() and the resource facades              │
//! │  - Owns the session slot and the connection state       │
//! │  - Supervisor task reconnects after unexpected closes   │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                      Session                            │
//! │  - An authenticated, ready-to-use connection            │
//! │  - Created via Session::open() + authenticate()         │
//! │  - Dies on disconnect (no auto-reconnect)               │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!         ┌──────────────┬───┴──────────┬──────────────┐
//!         ▼              ▼              ▼              ▼
//!     Transport      Protocol      Multiplexer        Auth
//! ```
//!
//! # State Machine
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Ready → (Closed | Disconnected)
//! ```
//!
//! # Reconnection Policy
//!
//! When a ready session closes without `disconnect()` having been called, the
//! supervisor task retries up to `max_reconnect_attempts` times, waiting
//! `attempt × reconnect_base_delay` before each try. The attempt counter goes
//! back to zero only once a session reaches `Ready`. Background failures are
//! logged, never returned; when the supervisor gives up the client stays
//! `Disconnected`.
//!
//! Independently, every call first makes sure a session is ready, driving up to
//! `ensure_attempts` connects itself. All connection establishment goes through
//! one lock, so two reconnects never overlap.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::session::Session;
use crate::config::{ClientConfig, Timing};
use crate::error::ClientError;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    /// Closed on request; no reconnection until `connect()` is called again
    Closed,
}

/// Delay before reconnection attempt number `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

/// A client for the appliance API.
///
/// Cheap to clone; clones share one connection. Tear it down with
/// [`Client::disconnect`]. Dropping the last clone also stops the supervisor.
///
/// # Guarantees
///
/// - `connect()` only returns `Ok` once a session is ready
/// - `call()` makes sure a session is ready before sending anything
/// - At most one session exists per client
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    /// The current session, if any
    session: RwLock<Option<Arc<Session>>>,
    /// Held while establishing a session
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    intentional_close: AtomicBool,
}

#[derive(Default)]
struct Link {
    supervisor: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a client. Nothing is connected until `connect()` or the first call.
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                session: RwLock::new(None),
                link: Mutex::new(Link::default()),
                state,
                attempts: AtomicU32::new(0),
                intentional_close: AtomicBool::new(false),
            }),
        }
    }

    /// Connect and log in.
    ///
    /// Returns immediately if a session is already ready. Failures are
    /// returned to the caller as-is.
    pub async fn connect(&self) -> Result<(), ClientError> {
        info!(host = %self.inner.config.endpoint.host, "Connecting to appliance");
        self.inner.intentional_close.store(false, Ordering::SeqCst);
        self.inner.connect_once().await.map(|_| ())
    }

    /// Close the connection on purpose.
    ///
    /// Stops the supervisor (including any scheduled reconnection), closes the
    /// session and rejects its pending calls. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.intentional_close.store(true, Ordering::SeqCst);

        let mut link = self.inner.link.lock().await;
        if let Some(supervisor) = link.supervisor.take() {
            supervisor.abort();
        }
        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }
        drop(link);

        self.inner.set_state(ConnectionState::Closed);
        info!("Disconnected from appliance");
    }

    /// Socket open and authenticated.
    pub async fn is_connected(&self) -> bool {
        self.inner.ready_session().await.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive reconnection attempts since the last `Ready`.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn timing(&self) -> &Timing {
        &self.inner.config.timing
    }

    /// Call a remote method, connecting first if needed.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let session = self.ensure_ready().await?;
        session.call(method, params).await
    }

    /// Return a ready session, connecting with bounded retries if there is none.
    ///
    /// Only transient failures are retried; a rejected API key or a bad
    /// configuration is returned on the first attempt.
    ///
    /// After `disconnect()` this fails with `NotConnected` until `connect()` is
    /// called again.
    pub async fn ensure_ready(&self) -> Result<Arc<Session>, ClientError> {
        if let Some(session) = self.inner.ready_session().await {
            return Ok(session);
        }
        if self.inner.intentional_close.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        let timing = &self.inner.config.timing;
        let max = timing.ensure_attempts;
        let mut last_error = ClientError::NotConnected;
        for attempt in 1..=max {
            match self.inner.connect_once().await {
                Ok(session) => return Ok(session),
                Err(e) if !e.is_connection_failure() => {
                    warn!(attempt = attempt, error = %e, "Connect attempt failed, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt = attempt, max = max, error = %e, "Connect attempt failed");
                    last_error = e;
                }
            }
            if attempt < max {
                tokio::time::sleep(backoff_delay(timing.ensure_base_delay, attempt)).await;
            }
        }
        Err(last_error)
    }
}

impl Inner {
    async fn ready_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|session| session.is_ready())
            .cloned()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Connection state change");
            *current = next;
            true
        });
    }

    /// One connection attempt, serialized with every other attempt.
    async fn connect_once(self: &Arc<Self>) -> Result<Arc<Session>, ClientError> {
        let mut link = self.link.lock().await;
        if let Some(session) = self.ready_session().await {
            return Ok(session);
        }
        if self.intentional_close.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        self.establish_locked(&mut link).await
    }

    /// Establish and install a session. Caller holds the link lock.
    async fn establish_locked(self: &Arc<Self>, link: &mut Link) -> Result<Arc<Session>, ClientError> {
        self.set_state(ConnectionState::Connecting);

        let established = async {
            let handshake = Session::open(&self.config).await?;
            self.set_state(ConnectionState::Authenticating);
            handshake.authenticate().await
        }
        .await;

        match established {
            Ok(session) => {
                let session = Arc::new(session);
                *self.session.write().await = Some(Arc::clone(&session));
                self.attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Ready);

                if link.supervisor.is_none() {
                    link.supervisor = Some(spawn_supervisor(Arc::downgrade(self), Arc::clone(&session)));
                }
                Ok(session)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Drop `session` from the slot if it is still the current one.
    async fn forget_session(&self, session: &Arc<Session>) {
        let mut slot = self.session.write().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, session)) {
            *slot = None;
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.link.get_mut().supervisor.take() {
            supervisor.abort();
        }
    }
}

// A plain fn so the spawned future's Send check does not recurse through establish_locked.
fn spawn_supervisor(inner: Weak<Inner>, session: Arc<Session>) -> JoinHandle<()> {
    tokio::spawn(supervise(inner, session))
}

/// Supervisor loop - runs in a spawned task while a session exists.
///
/// Holds only a weak reference to the client, upgraded for each step and
/// released before any sleep, so dropping the last `Client` tears everything
/// down even in the middle of a backoff sequence.
async fn supervise(inner: Weak<Inner>, mut session: Arc<Session>) {
    loop {
        session.closed().await;

        {
            let Some(client) = inner.upgrade() else {
                return;
            };

            if session.closed_intentionally() || client.intentional_close.load(Ordering::SeqCst) {
                debug!("Session closed on request, supervisor stopping");
                client.link.lock().await.supervisor = None;
                client.set_state(ConnectionState::Closed);
                return;
            }

            warn!(url = %session.url(), "Session closed unexpectedly");
            client.forget_session(&session).await;
        }

        match reconnect_with_backoff(&inner).await {
            Some(next) => session = next,
            None => return,
        }
    }
}

/// Background reconnection. Returns the session to watch next, or None when
/// the supervisor should stop.
async fn reconnect_with_backoff(inner: &Weak<Inner>) -> Option<Arc<Session>> {
    loop {
        let (attempt, delay) = {
            let client = inner.upgrade()?;
            let mut link = client.link.lock().await;
            if let Some(session) = client.ready_session().await {
                return Some(session);
            }
            if client.intentional_close.load(Ordering::SeqCst) {
                return None;
            }
            let max = client.config.timing.max_reconnect_attempts;
            if client.attempts.load(Ordering::SeqCst) >= max {
                error!(attempts = max, "Reconnection attempts exhausted, staying disconnected");
                client.set_state(ConnectionState::Disconnected);
                link.supervisor = None;
                return None;
            }

            let attempt = client.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = backoff_delay(client.config.timing.reconnect_base_delay, attempt);
            info!(
                attempt = attempt,
                max = max,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnection"
            );
            (attempt, delay)
        };

        tokio::time::sleep(delay).await;

        let client = inner.upgrade()?;
        let mut link = client.link.lock().await;
        if let Some(session) = client.ready_session().await {
            return Some(session);
        }
        if client.intentional_close.load(Ordering::SeqCst) {
            return None;
        }
        match client.establish_locked(&mut link).await {
            Ok(session) => {
                info!(attempt = attempt, "Reconnected to appliance");
                return Some(session);
            }
            Err(e) => {
                warn!(attempt = attempt, error = %e, "Reconnection attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    fn config() -> ClientConfig {
        ClientConfig {
            endpoint: Endpoint {
                host: "127.0.0.1".into(),
                port: Some(1),
                secure: false,
                path: "/websocket".into(),
                verify_certificates: false,
            },
            api_key: "key".into(),
            timing: Timing::default(),
        }
    }

    #[test]
    fn test_backoff_strictly_increases() {
        let base = Duration::from_secs(2);
        let delays: Vec<Duration> = (1..=5).map(|n| backoff_delay(base, n)).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(10));
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = Client::new(config());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected().await);
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_closed() {
        let client = Client::new(config());
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.call("vm.query", Value::Null).await,
            Err(ClientError::NotConnected)
        ));
    }
}
