//! Appliance Connection Module
//!
//! This module provides a persistent, authenticated connection to the appliance
//! management API.
//!
//! # Architecture
//!
//! The module is organized by concern, with each submodule having a single responsibility:
//!
//! | Module        | Responsibility                                    |
//! |---------------|---------------------------------------------------|
//! | `transport`   | WebSocket connect/send, TLS for self-signed certs |
//! | `protocol`    | JSON frame encoding and decoding                  |
//! | `multiplexer` | Correlation ids, pending calls, call timeouts     |
//! | `auth`        | API key login with fallback                       |
//! | `session`     | An authenticated, ready-to-use connection         |
//! | `client`      | High-level client with automatic reconnection     |
//!
//! # Key Design Principles
//!
//! ## 1. A Session Is Ready Or It Does Not Exist
//!
//! - `Session` can only be obtained through `Session::open()` + `Handshake::authenticate()`
//! - Both block until their phase is complete
//! - If you have a `Session`, it logged in
//!
//! ## 2. Phase Decides Who Sees A Frame
//!
//! - The receive loop consults the session's route (handshake, login, ready)
//! - No handler swapping, no shared callback slot
//!
//! ## 3. Clear Ownership
//!
//! - Each session owns its socket, receive loop and pending table
//! - Closing a session rejects everything still waiting on it
//! - The client owns the session slot and the supervisor task
//!
//! # Usage
//!
//! ```ignore
//! use nas_remote::connection::Client;
//!
//! let client = Client::new(config.resolve()?);
//! client.connect().await?;
//!
//! let vms = client.call("vm.query", serde_json::json!([])).await?;
//!
//! client.disconnect().await;
//! ```

// Internal modules - not exposed publicly
mod auth;
mod transport;

// Public modules
pub mod client;
pub mod multiplexer;
pub mod protocol;
pub mod session;

// Re-export the public API
pub use auth::{AuthMethod, LOGIN_METHOD};
pub use client::{backoff_delay, Client, ConnectionState};
pub use session::{Handshake, Session};
