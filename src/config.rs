//! Configuration for nas-remote
//!
//! The file format is TOML. Every field is optional in the file so that CLI
//! flags and environment variables can fill the gaps; [`Config::resolve`]
//! checks that the required ones are present before anything touches the
//! network.
//!
//! ```toml
//! host = "nas.local"
//! secure = true
//! api_key = "1-abcdef"
//!
//! [timing]
//! request_timeout_ms = 30000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ClientError;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nas-remote")
        .join("config.toml")
}

/// Configuration as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Appliance hostname or address
    #[serde(default)]
    pub host: Option<String>,

    /// Port override (defaults to 443 for secure, 80 otherwise)
    #[serde(default)]
    pub port: Option<u16>,

    /// Use wss:// instead of ws://
    #[serde(default)]
    pub secure: Option<bool>,

    /// API key used for login
    #[serde(default)]
    pub api_key: Option<String>,

    /// WebSocket path on the appliance
    #[serde(default = "default_path")]
    pub path: String,

    /// Validate the server certificate against webpki roots.
    /// Appliances usually ship self-signed certificates, so this is off by default.
    #[serde(default)]
    pub verify_certificates: bool,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Timer settings, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Pause between sending the connect frame and starting login
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// How long to wait after the fallback login frame before assuming success
    #[serde(default = "default_fallback_grace_ms")]
    pub fallback_grace_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Keepalive ping interval (0 = disabled)
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Connect attempts an operation makes before giving up
    #[serde(default = "default_ensure_attempts")]
    pub ensure_attempts: u32,

    #[serde(default = "default_ensure_base_delay_ms")]
    pub ensure_base_delay_ms: u64,

    /// Pause between stop and start when restarting a VM
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
}

fn default_path() -> String {
    "/websocket".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_fallback_grace_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    2_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_ensure_attempts() -> u32 {
    3
}

fn default_ensure_base_delay_ms() -> u64 {
    1_000
}

fn default_restart_settle_ms() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            secure: None,
            api_key: None,
            path: default_path(),
            verify_certificates: false,
            timing: TimingConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            fallback_grace_ms: default_fallback_grace_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ensure_attempts: default_ensure_attempts(),
            ensure_base_delay_ms: default_ensure_base_delay_ms(),
            restart_settle_ms: default_restart_settle_ms(),
        }
    }
}

impl From<&TimingConfig> for Timing {
    fn from(t: &TimingConfig) -> Self {
        let ms = Duration::from_millis;
        Self {
            handshake_timeout: ms(t.handshake_timeout_ms),
            settle_delay: ms(t.settle_delay_ms),
            auth_timeout: ms(t.auth_timeout_ms),
            fallback_grace: ms(t.fallback_grace_ms),
            request_timeout: ms(t.request_timeout_ms),
            keepalive_interval: (t.keepalive_interval_ms > 0).then(|| ms(t.keepalive_interval_ms)),
            reconnect_base_delay: ms(t.reconnect_base_delay_ms),
            max_reconnect_attempts: t.max_reconnect_attempts,
            ensure_attempts: t.ensure_attempts.max(1),
            ensure_base_delay: ms(t.ensure_base_delay_ms),
            restart_settle: ms(t.restart_settle_ms),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate required fields and build the runtime configuration.
    pub fn resolve(&self) -> Result<ClientConfig, ClientError> {
        let host = required(&self.host, "host")?;
        let api_key = required(&self.api_key, "api_key")?;
        let secure = self
            .secure
            .ok_or_else(|| ClientError::Config("secure is required (true for wss, false for ws)".into()))?;

        let endpoint = Endpoint {
            host,
            port: self.port,
            secure,
            path: self.path.clone(),
            verify_certificates: self.verify_certificates,
        };
        // Fail on a malformed host before any connection attempt
        endpoint.url()?;

        Ok(ClientConfig {
            endpoint,
            api_key,
            timing: Timing::from(&self.timing),
        })
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String, ClientError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ClientError::Config(format!("{} is required", name))),
    }
}

/// Where the appliance API lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
    pub secure: bool,
    pub path: String,
    pub verify_certificates: bool,
}

impl Endpoint {
    pub fn default_port(&self) -> u16 {
        if self.secure {
            443
        } else {
            80
        }
    }

    /// Build the WebSocket URL.
    pub fn url(&self) -> Result<Url, ClientError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let port = self.port.unwrap_or_else(|| self.default_port());
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let url = Url::parse(&format!("{}://{}:{}{}", scheme, self.host, port, path))
            .map_err(|e| ClientError::Config(format!("Invalid endpoint '{}': {}", self.host, e)))?;
        if url.host_str().is_none() {
            return Err(ClientError::Config(format!("Invalid endpoint '{}': no host", self.host)));
        }
        Ok(url)
    }
}

/// Resolved timer settings.
#[derive(Debug, Clone)]
pub struct Timing {
    pub handshake_timeout: Duration,
    pub settle_delay: Duration,
    pub auth_timeout: Duration,
    pub fallback_grace: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ensure_attempts: u32,
    pub ensure_base_delay: Duration,
    pub restart_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing::from(&TimingConfig::default())
    }
}

/// Everything a `Client` needs, validated.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub api_key: String,
    pub timing: Timing,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Config {
        Config {
            host: Some("nas.local".into()),
            secure: Some(true),
            api_key: Some("1-secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_timing_defaults() {
        let timing = Timing::default();
        assert_eq!(timing.auth_timeout, Duration::from_secs(10));
        assert_eq!(timing.request_timeout, Duration::from_secs(30));
        assert_eq!(timing.reconnect_base_delay, Duration::from_secs(2));
        assert_eq!(timing.max_reconnect_attempts, 5);
        assert_eq!(timing.ensure_attempts, 3);
        assert_eq!(timing.restart_settle, Duration::from_secs(1));
    }

    #[test]
    fn test_empty_config_keeps_default_path() {
        let config = Config::default();
        assert_eq!(config.path, "/websocket");
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_secure_endpoint_uses_443() {
        let config = complete().resolve().unwrap();
        let url = config.endpoint.url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.port_or_known_default(), Some(443));
        assert_eq!(url.path(), "/websocket");
    }

    #[test]
    fn test_plain_endpoint_with_port_override() {
        let mut config = complete();
        config.secure = Some(false);
        config.port = Some(8080);
        let url = config.resolve().unwrap().endpoint.url().unwrap();
        assert_eq!(url.as_str(), "ws://nas.local:8080/websocket");
    }

    #[test]
    fn test_missing_fields_are_config_errors() {
        for strip in ["host", "api_key", "secure"] {
            let mut config = complete();
            match strip {
                "host" => config.host = None,
                "api_key" => config.api_key = Some("  ".into()),
                _ => config.secure = None,
            }
            let err = config.resolve().unwrap_err();
            assert!(matches!(err, ClientError::Config(ref m) if m.contains(strip)), "{err}");
        }
    }

    #[test]
    fn test_zero_keepalive_disables_ping() {
        let timing = Timing::from(&TimingConfig {
            keepalive_interval_ms: 0,
            ..Default::default()
        });
        assert!(timing.keepalive_interval.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = complete();
        config.timing.request_timeout_ms = 1234;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.host.as_deref(), Some("nas.local"));
        assert_eq!(loaded.timing.request_timeout_ms, 1234);
        assert_eq!(loaded.path, "/websocket");
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let config: Config = toml::from_str("host = \"10.0.0.2\"\nsecure = false\n").unwrap();
        assert_eq!(config.timing.auth_timeout_ms, 10_000);
        assert!(config.api_key.is_none());
        assert!(!config.verify_certificates);
    }
}
