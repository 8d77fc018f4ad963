//! Typed operations on virtual machines and applications.
//!
//! Thin layer over [`Client::call`]. Every read is a fresh round trip; nothing
//! is cached. Redundant transitions (starting a running VM) are passed to the
//! appliance as-is, deciding whether to issue them is the caller's business.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::connection::Client;
use crate::error::ClientError;

pub const VM_QUERY: &str = "vm.query";
pub const VM_START: &str = "vm.start";
pub const VM_STOP: &str = "vm.stop";
pub const APP_QUERY: &str = "app.query";
pub const APP_START: &str = "app.start";
pub const APP_STOP: &str = "app.stop";

/// A virtual machine as reported by `vm.query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vcpus: Option<u32>,
    /// Memory in MiB
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub autostart: Option<bool>,
    #[serde(default)]
    pub status: VmStatus,
    /// Fields this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub domain_state: Option<String>,
}

/// An application as reported by `app.query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub upgrade_available: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VirtualMachine {
    pub fn is_running(&self) -> bool {
        self.status.state.eq_ignore_ascii_case("RUNNING")
    }
}

impl App {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("RUNNING")
    }
}

/// Equality filter in the appliance's query syntax: `[[[field, "=", value]]]`.
fn eq_filter(field: &str, value: Value) -> Value {
    json!([[[field, "=", value]]])
}

async fn query<T: DeserializeOwned>(client: &Client, method: &str, params: Value) -> Result<Vec<T>, ClientError> {
    let rows = client.call(method, params).await?;
    serde_json::from_value(rows)
        .map_err(|e| ClientError::Protocol(format!("Unexpected {} result: {}", method, e)))
}

impl Client {
    pub fn vms(&self) -> Vms<'_> {
        Vms { client: self }
    }

    pub fn apps(&self) -> Apps<'_> {
        Apps { client: self }
    }
}

/// Virtual machine operations. VMs are addressed by numeric id.
pub struct Vms<'a> {
    client: &'a Client,
}

impl Vms<'_> {
    pub async fn list(&self) -> Result<Vec<VirtualMachine>, ClientError> {
        query(self.client, VM_QUERY, json!([])).await
    }

    /// Look a VM up by numeric id, or by name if `name_or_id` is not a number.
    pub async fn get(&self, name_or_id: &str) -> Result<VirtualMachine, ClientError> {
        let filter = match name_or_id.parse::<u64>() {
            Ok(id) => eq_filter("id", json!(id)),
            Err(_) => eq_filter("name", json!(name_or_id)),
        };
        let mut rows: Vec<VirtualMachine> = query(self.client, VM_QUERY, filter).await?;
        if rows.is_empty() {
            return Err(ClientError::NotFound(format!("virtual machine '{}'", name_or_id)));
        }
        Ok(rows.swap_remove(0))
    }

    /// Current state string (e.g. `RUNNING`, `STOPPED`), read fresh.
    pub async fn state(&self, name_or_id: &str) -> Result<String, ClientError> {
        Ok(self.get(name_or_id).await?.status.state)
    }

    pub async fn start(&self, id: u64) -> Result<Value, ClientError> {
        info!(vm = id, "Starting virtual machine");
        self.client.call(VM_START, json!([id])).await
    }

    pub async fn stop(&self, id: u64, force: bool) -> Result<Value, ClientError> {
        info!(vm = id, force = force, "Stopping virtual machine");
        self.client.call(VM_STOP, json!([id, { "force": force }])).await
    }

    /// Stop, wait the restart settle delay, start.
    pub async fn restart(&self, id: u64) -> Result<Value, ClientError> {
        self.stop(id, false).await?;
        let settle = self.client.timing().restart_settle;
        debug!(vm = id, settle_ms = settle.as_millis() as u64, "Waiting before start");
        tokio::time::sleep(settle).await;
        self.start(id).await
    }
}

/// Application operations. Apps are addressed by name.
pub struct Apps<'a> {
    client: &'a Client,
}

impl Apps<'_> {
    pub async fn list(&self) -> Result<Vec<App>, ClientError> {
        query(self.client, APP_QUERY, json!([])).await
    }

    pub async fn get(&self, name: &str) -> Result<App, ClientError> {
        let mut rows: Vec<App> = query(self.client, APP_QUERY, eq_filter("name", json!(name))).await?;
        if rows.is_empty() {
            return Err(ClientError::NotFound(format!("app '{}'", name)));
        }
        Ok(rows.swap_remove(0))
    }

    pub async fn state(&self, name: &str) -> Result<String, ClientError> {
        Ok(self.get(name).await?.state)
    }

    pub async fn start(&self, name: &str) -> Result<Value, ClientError> {
        info!(app = %name, "Starting app");
        self.client.call(APP_START, json!([name])).await
    }

    pub async fn stop(&self, name: &str) -> Result<Value, ClientError> {
        info!(app = %name, "Stopping app");
        self.client.call(APP_STOP, json!([name])).await
    }

    /// Stop then start, no pause in between.
    pub async fn restart(&self, name: &str) -> Result<Value, ClientError> {
        self.stop(name).await?;
        self.start(name).await
    }
}
