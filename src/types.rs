//! socksrotor-core/src/types.rs
//! Core data structures, type aliases, and constants shared across the engine.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifies one accepted client connection for the lifetime of its task.
pub type ConnId = u64;

/// One upstream protocol a `ProxyEntry` can speak, or the synthesized direct path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProxyProtocol {
    Socks5,
    Socks4,
    Http,
    Direct,
}

/// Stable identity of a proxy entry, ignoring mutable fields (credentials,
/// `active`, `lastError`). Used to pin the round-robin tie-break described
/// in the rotation cursor design note: identity wins, cursor is advisory.
pub type ProxyIdentity = (ProxyProtocol, String, u16);

/// One upstream proxy in the rotation pool.
///
/// `active = false` means rotation skips the entry, but it is still listed
/// for the host UI. `Direct` entries are synthesized per-request by the
/// bypass resolver and never stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ProxyEntry {
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            username: None,
            password: None,
            active: true,
            last_error: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Synthesizes a direct entry for the bypass path. Never enters the registry.
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyProtocol::Direct, host, port)
    }

    /// `"host:port"`, used as the key into the per-proxy counters and cache maps.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn identity(&self) -> ProxyIdentity {
        (self.protocol, self.host.clone(), self.port)
    }
}

/// Rotation policy used by `ProxyRegistry::select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SelectionMode {
    #[default]
    Random,
    RoundRobin,
}

/// Runtime-mutable configuration surface (§6). All fields are hot-reloadable
/// through `ProxyEngine::update_settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_conn_per_proxy")]
    pub max_connections_per_proxy: u32,
    #[serde(default = "default_true")]
    pub logging_enabled: bool,
    #[serde(default = "default_true")]
    pub bypass_collaborator_enabled: bool,
    #[serde(default = "default_bypass_domains")]
    pub bypass_domains: Vec<String>,
    #[serde(default)]
    pub selection_mode: SelectionMode,
}

fn default_buffer_size() -> usize {
    8192
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_max_conn_per_proxy() -> u32 {
    50
}
fn default_true() -> bool {
    true
}
fn default_bypass_domains() -> Vec<String> {
    vec!["burpcollaborator.net".to_string(), "oastify.com".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_connections_per_proxy: default_max_conn_per_proxy(),
            logging_enabled: true,
            bypass_collaborator_enabled: true,
            bypass_domains: default_bypass_domains(),
            selection_mode: SelectionMode::Random,
        }
    }
}

/// SOCKS address-type tag (RFC 1928 §5), reused verbatim when re-emitting a
/// client's request to a SOCKS upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    V4 = 1,
    Domain = 3,
    V6 = 4,
}

/// A parsed CONNECT target: host text (dotted IPv4, canonical IPv6, or a
/// domain name), port, and the address-type tag under which it arrived.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub addr_type: AddrType,
}

/// Notification fired after the registry marks an entry inactive.
pub type ProxyFailedCallback = Arc<dyn Fn(&str, u16, &str) + Send + Sync>;
/// Notification fired after a health check reactivates a previously-failed entry.
pub type ProxyReactivatedCallback = Arc<dyn Fn(&str, u16) + Send + Sync>;
/// Structured log sink forwarded to the host, independent of `tracing`'s own
/// subscriber (kept distinct per §1: log sinks are an external collaborator).
pub type LogCallback = Arc<dyn Fn(tracing::Level, &str) + Send + Sync>;

/// Point-in-time connection statistics, rendered by `ProxyEngine::stats`.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub active_connections: u64,
    pub proxies_in_use: usize,
    pub busiest: Option<(String, u64)>,
}

impl Stats {
    /// `"Active connections: N | Using K proxies[, busiest: host:port(M)]"`
    pub fn render(&self) -> String {
        let mut s = format!(
            "Active connections: {} | Using {} proxies",
            self.active_connections, self.proxies_in_use
        );
        if let Some((key, count)) = &self.busiest {
            if *count > 2 {
                s.push_str(&format!(", busiest: {key}({count})"));
            }
        }
        s
    }
}
