use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::common::{Error, Result};

/// Runtime configuration for one client or server instance. The JSON
/// config file uses the classic field names (`server`, `local_address`,
/// `port_password`, …); everything is optional and falls back to the
/// defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server listening / target address.
    #[serde(rename = "server")]
    pub server_host: String,
    pub server_port: u16,
    /// Per-port passwords; when present the server runs one listener per
    /// entry and ignores `password`.
    pub port_password: Option<HashMap<String, String>>,
    /// Client bind address.
    #[serde(rename = "local_address")]
    pub local_host: String,
    /// Client bind port.
    pub local_port: u16,
    pub password: String,
    /// Base64 pre-derived key; wins over `password` when non-empty.
    pub key: String,
    pub method: String,
    /// TCP keep-alive period in seconds.
    #[serde(rename = "timeout")]
    pub timeout_seconds: u64,
    /// Server-side destination connect timeout in seconds.
    pub connect_timeout_seconds: u64,
    /// Proxy to IPv4 destinations only (server side).
    #[serde(rename = "v4only")]
    pub v4_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "::".to_string(),
            server_port: 8388,
            port_password: None,
            local_host: "127.0.0.1".to_string(),
            local_port: 1080,
            password: String::new(),
            key: String::new(),
            method: "chacha20-ietf-poly1305".to_string(),
            timeout_seconds: 300,
            connect_timeout_seconds: 15,
            v4_only: false,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn key_b64(&self) -> Option<&str> {
        if self.key.is_empty() {
            None
        } else {
            Some(&self.key)
        }
    }

    /// Validated `port_password` entries.
    pub fn port_passwords(&self) -> Result<Vec<(u16, String)>> {
        let Some(map) = &self.port_password else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::with_capacity(map.len());
        for (port, password) in map {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::InvalidAddress)?;
            if port == 0 {
                return Err(Error::InvalidAddress);
            }
            entries.push((port, password.clone()));
        }
        entries.sort_by_key(|(port, _)| *port);
        Ok(entries)
    }
}
