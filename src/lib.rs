//! nas-remote - client for the appliance management API
//!
//! Talks to a storage/hypervisor appliance over its WebSocket JSON API to list,
//! start, stop and restart virtual machines and applications.
//!
//! ## Architecture
//!
//! - **connection**: transport, wire protocol, request multiplexing, login and
//!   reconnection (see the module docs for the layering)
//! - **resources**: typed VM/app operations on top of `Client::call`
//! - **config**: TOML configuration with CLI/env overrides
//!
//! ## Example
//!
//! ```ignore
//! let config = nas_remote::Config::load(nas_remote::config::default_config_path())?;
//! let client = nas_remote::Client::new(config.resolve()?);
//! client.connect().await?;
//!
//! for vm in client.vms().list().await? {
//!     println!("{} {}", vm.name, vm.status.state);
//! }
//! client.apps().restart("plex").await?;
//! client.disconnect().await;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod resources;

// Re-exports
pub use config::{ClientConfig, Config, Endpoint, Timing};
pub use connection::{AuthMethod, Client, ConnectionState, Session};
pub use error::ClientError;
pub use resources::{App, Apps, VirtualMachine, Vms, VmStatus};
