//! In-process mock appliance for integration tests.
//!
//! Speaks the JSON WebSocket protocol over a real TCP socket on 127.0.0.1.
//! Login behaviour is switchable at runtime; every other method call is
//! answered by a handler closure.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use nas_remote::config::{ClientConfig, Endpoint, Timing};
use nas_remote::{Client, ConnectionState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub const API_KEY: &str = "1-test-key";

/// How the mock answers `auth.login_with_api_key`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoginMode {
    /// `result: true` when the key matches, `result: false` otherwise
    Accept,
    /// error frame
    Reject,
    /// bare `failed` frame (triggers the fallback login)
    Failed,
    /// no answer at all
    Silent,
    /// `result: true` under a different id
    WrongId,
}

/// Handler answer for a method call.
pub enum Reply {
    Result(Value),
    Error(String),
    Delayed(Duration, Value),
    /// A malformed text frame, then the result
    GarbageThen(Value),
    NoReply,
}

pub type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Received {
    pub frame: Value,
    pub at: Instant,
}

struct MockState {
    login: Mutex<LoginMode>,
    handler: Handler,
    received: Mutex<Vec<Received>>,
    connections: AtomicUsize,
    kill: broadcast::Sender<()>,
}

pub struct MockAppliance {
    pub port: u16,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockAppliance {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (kill, _) = broadcast::channel(4);
        let state = Arc::new(MockState {
            login: Mutex::new(LoginMode::Accept),
            handler: Arc::new(handler),
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            kill,
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(serve(socket, state));
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    /// A mock that answers every method with `null`.
    pub async fn start_default() -> Self {
        Self::start(|_, _| Reply::Result(Value::Null)).await
    }

    pub fn set_login(&self, mode: LoginMode) {
        *self.state.login.lock().unwrap() = mode;
    }

    /// WebSocket connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Drop every live connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.state.kill.send(());
    }

    /// Stop listening and drop every connection. Later connects are refused.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    /// Method calls received, excluding login.
    pub fn method_calls(&self) -> Vec<(String, Value, Instant)> {
        self.received()
            .into_iter()
            .filter(|r| r.frame["msg"] == "method" && r.frame["method"] != "auth.login_with_api_key")
            .map(|r| {
                (
                    r.frame["method"].as_str().unwrap_or_default().to_string(),
                    r.frame["params"].clone(),
                    r.at,
                )
            })
            .collect()
    }

    pub fn config(&self) -> ClientConfig {
        test_config(self.port)
    }
}

impl Drop for MockAppliance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client configuration with short timers.
pub fn test_config(port: u16) -> ClientConfig {
    ClientConfig {
        endpoint: Endpoint {
            host: "127.0.0.1".into(),
            port: Some(port),
            secure: false,
            path: "/websocket".into(),
            verify_certificates: false,
        },
        api_key: API_KEY.into(),
        timing: Timing {
            handshake_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_millis(20),
            auth_timeout: Duration::from_millis(500),
            fallback_grace: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            keepalive_interval: None,
            reconnect_base_delay: Duration::from_millis(50),
            max_reconnect_attempts: 5,
            ensure_attempts: 3,
            ensure_base_delay: Duration::from_millis(20),
            restart_settle: Duration::from_millis(100),
        },
    }
}

/// Wait until the client reaches `state`, panicking after `within`.
pub async fn wait_for_state(client: &Client, state: ConnectionState, within: Duration) {
    let mut rx = client.subscribe();
    tokio::time::timeout(within, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("client never reached {state:?} (now {:?})", client.state()))
        .unwrap();
}

type Sink = Arc<AsyncMutex<futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>>>;

async fn serve(socket: TcpStream, state: Arc<MockState>) {
    let Ok(ws) = accept_async(socket).await else {
        return;
    };
    let number = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut kill = state.kill.subscribe();
    let (sink, mut stream) = ws.split();
    let sink: Sink = Arc::new(AsyncMutex::new(sink));

    loop {
        let msg = tokio::select! {
            _ = kill.recv() => return,
            msg = stream.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.received.lock().unwrap().push(Received {
            frame: frame.clone(),
            at: Instant::now(),
        });

        match frame["msg"].as_str() {
            Some("connect") => {
                send(&sink, json!({"msg": "connected", "session": format!("mock-{number}")})).await;
            }
            Some("ping") => send(&sink, json!({"msg": "pong"})).await,
            Some("method") => {
                let id = frame["id"].clone();
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                let params = frame["params"].clone();
                if method == "auth.login_with_api_key" {
                    answer_login(&sink, &state, id, &params).await;
                    continue;
                }
                match (state.handler)(&method, &params) {
                    Reply::Result(result) => {
                        send(&sink, json!({"msg": "result", "id": id, "result": result})).await
                    }
                    Reply::Error(message) => {
                        send(
                            &sink,
                            json!({"msg": "error", "id": id, "error": {"code": "EFAULT", "message": message}}),
                        )
                        .await
                    }
                    Reply::Delayed(after, result) => {
                        let sink = Arc::clone(&sink);
                        tokio::spawn(async move {
                            tokio::time::sleep(after).await;
                            send(&sink, json!({"msg": "result", "id": id, "result": result})).await;
                        });
                    }
                    Reply::GarbageThen(result) => {
                        let _ = sink.lock().await.send(Message::Text("{not json".into())).await;
                        send(&sink, json!({"msg": "result", "id": id, "result": result})).await
                    }
                    Reply::NoReply => {}
                }
            }
            _ => {}
        }
    }
}

async fn answer_login(sink: &Sink, state: &MockState, id: Value, params: &Value) {
    let mode = *state.login.lock().unwrap();
    let key_ok = params[0] == API_KEY;
    let frame = match mode {
        LoginMode::Accept => json!({"msg": "result", "id": id, "result": key_ok}),
        LoginMode::Reject => {
            json!({"msg": "error", "id": id, "error": {"code": "EACCES", "message": "Invalid API key"}})
        }
        LoginMode::Failed => json!({"msg": "failed", "version": "1"}),
        LoginMode::WrongId => json!({"msg": "result", "id": "not-yours", "result": true}),
        LoginMode::Silent => return,
    };
    send(sink, frame).await;
}

async fn send(sink: &Sink, frame: Value) {
    let _ = sink.lock().await.send(Message::Text(frame.to_string())).await;
}
