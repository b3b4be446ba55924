use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Clash routing mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClashMode {
    Rule,
    Global,
    Direct,
    Script,
}

impl ClashMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClashMode::Rule => "rule",
            ClashMode::Global => "global",
            ClashMode::Direct => "direct",
            ClashMode::Script => "script",
        }
    }

    /// Parse a mode as reported by the core (older cores capitalize it)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rule" => Some(ClashMode::Rule),
            "global" => Some(ClashMode::Global),
            "direct" => Some(ClashMode::Direct),
            "script" => Some(ClashMode::Script),
            _ => None,
        }
    }

    pub fn next(&self) -> Self {
        match self {
            ClashMode::Rule => ClashMode::Global,
            ClashMode::Global => ClashMode::Direct,
            ClashMode::Direct | ClashMode::Script => ClashMode::Rule,
        }
    }
}

/// Config response from GET /configs
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigResponse {
    #[serde(default)]
    pub port: u16,
    #[serde(rename = "socks-port", default)]
    pub socks_port: u16,
    #[serde(rename = "redir-port", default)]
    pub redir_port: u16,
    #[serde(rename = "mixed-port", default)]
    pub mixed_port: u16,
    #[serde(rename = "allow-lan", default)]
    pub allow_lan: bool,
    #[serde(default)]
    pub mode: String,
    #[serde(rename = "log-level", default)]
    pub log_level: String,
}

impl ConfigResponse {
    pub fn clash_mode(&self) -> Option<ClashMode> {
        ClashMode::from_str(&self.mode)
    }
}

/// Proxy node or group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Proxy {
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub name: String,
    pub now: Option<String>,
    pub all: Option<Vec<String>>,
    pub history: Option<Vec<DelayHistory>>,
    pub udp: Option<bool>,
}

impl Proxy {
    pub fn is_group(&self) -> bool {
        matches!(
            self.proxy_type.as_str(),
            "Selector" | "URLTest" | "Fallback" | "LoadBalance" | "Smart"
        )
    }
}

/// Delay history
#[derive(Debug, Clone, Deserialize)]
pub struct DelayHistory {
    pub time: String,
    pub delay: u32,
}

/// Proxies response from GET /proxies
#[derive(Debug, Clone, Deserialize)]
pub struct ProxiesResponse {
    pub proxies: HashMap<String, Proxy>,
}

/// Provider info
#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub name: String,
    #[serde(rename = "type", default)]
    pub provider_type: String,
    #[serde(rename = "vehicleType", default)]
    pub vehicle_type: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub proxies: Vec<Proxy>,
}

/// Providers response from GET /providers/proxies
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersResponse {
    pub providers: HashMap<String, Provider>,
}

/// Delay test response from GET /proxies/:name/delay
#[derive(Debug, Clone, Deserialize)]
pub struct DelayResponse {
    pub delay: u32,
}

/// Version response from GET /version
#[derive(Debug, Clone, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub premium: bool,
}

/// Core flavor reported by `/version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Premium,
    Meta,
    Unknown,
}

impl VersionResponse {
    pub fn server_type(&self) -> ServerType {
        if self.premium {
            ServerType::Premium
        } else if self.meta {
            ServerType::Meta
        } else {
            ServerType::Unknown
        }
    }
}

/// Connection metadata
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionMetadata {
    pub network: String,
    #[serde(rename = "type")]
    pub conn_type: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    #[serde(rename = "destinationIP")]
    pub destination_ip: Option<String>,
    #[serde(rename = "sourcePort")]
    pub source_port: String,
    #[serde(rename = "destinationPort")]
    pub destination_port: String,
    pub host: String,
    #[serde(rename = "dnsMode")]
    pub dns_mode: Option<String>,
    #[serde(rename = "processPath")]
    pub process_path: Option<String>,
}

/// One connection inside a snapshot
#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    pub id: String,
    pub metadata: ConnectionMetadata,
    pub upload: u64,
    pub download: u64,
    pub start: String,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub rule: String,
    #[serde(rename = "rulePayload", default)]
    pub rule_payload: String,
}

/// Snapshot from GET /connections (one push on the WebSocket)
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionsResponse {
    #[serde(rename = "downloadTotal")]
    pub download_total: u64,
    #[serde(rename = "uploadTotal")]
    pub upload_total: u64,
    // the core sends null instead of [] when nothing is open
    #[serde(default)]
    pub connections: Option<Vec<Connection>>,
    #[serde(default)]
    pub memory: Option<u64>,
}

/// Raw message from the /logs WebSocket
#[derive(Debug, Clone, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "type")]
    pub level: String,
    pub payload: String,
}
