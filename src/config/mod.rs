use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::CredentialStore;
use crate::logs::LogLevel;
use crate::monitor::MonitorOptions;
use crate::plugin::PluginKind;
use crate::restart::RestartTiming;
use crate::transport::{ServerEndpoint, TrustPolicy};

/// How a server is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerKind {
    /// Clash external controller
    Direct {
        #[serde(default)]
        secret: Option<String>,
    },
    /// OpenWRT router; the password comes from the credential store
    Luci { plugin: PluginKind, username: String },
}

/// One saved server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub kind: ServerKind,
}

impl ServerProfile {
    /// Build the endpoint, looking up the router password for LuCI servers
    pub fn endpoint(&self, store: &dyn CredentialStore) -> Result<ServerEndpoint> {
        let endpoint = match &self.kind {
            ServerKind::Direct { secret } => {
                ServerEndpoint::direct(self.host.clone(), self.port, secret.clone())
            }
            ServerKind::Luci { plugin, username } => {
                let stored = store
                    .get(&self.id)
                    .with_context(|| format!("No password for server '{}'", self.name))?;
                ServerEndpoint::luci(
                    self.host.clone(),
                    self.port,
                    username.clone(),
                    stored.password,
                    *plugin,
                )
            }
        };
        Ok(endpoint.with_tls(self.tls))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub closed_grace_snapshots: u32,
    pub snapshot_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            backoff_min_ms: 1000,
            backoff_max_ms: 30_000,
            closed_grace_snapshots: 1,
            snapshot_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: LogLevel,
    pub buffer_capacity: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            buffer_capacity: crate::logs::DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub poll_interval_ms: u64,
    pub line_throttle_ms: u64,
    pub max_iterations: u32,
    pub settle_delay_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            line_throttle_ms: 200,
            max_iterations: 300,
            settle_delay_ms: 2000,
        }
    }
}

/// clash-dash application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Saved servers
    #[serde(default)]
    pub servers: Vec<ServerProfile>,

    /// Id of the server used when none is given
    #[serde(default)]
    pub default_server: Option<String>,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub logs: LogSettings,

    #[serde(default)]
    pub restart: RestartSettings,

    /// Accept self-signed certificates from LAN routers
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
}

fn default_accept_invalid_certs() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            default_server: None,
            monitor: MonitorSettings::default(),
            logs: LogSettings::default(),
            restart: RestartSettings::default(),
            accept_invalid_certs: true,
        }
    }
}

pub const CLI_SERVER_ID: &str = "cli";

impl AppConfig {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        Ok(config_dir.join("clash-dash").join("config.yaml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            // Return default config if file doesn't exist
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents)?;

        Ok(())
    }

    /// Load from `path`, merge command line overrides and persist them.
    /// An unreadable file is an error and is left untouched.
    pub fn load_with_cli(
        path: &Path,
        api_url: Option<String>,
        secret: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::load_from(path)?;
        if api_url.is_some() || secret.is_some() {
            config.merge_cli(api_url, secret)?;
            config
                .save_to(path)
                .with_context(|| format!("Failed to save config to {}", path.display()))?;
        }
        Ok(config)
    }

    /// Merge command line arguments into config. A controller URL becomes
    /// the `cli` server and the default.
    pub fn merge_cli(&mut self, api_url: Option<String>, secret: Option<String>) -> Result<()> {
        if let Some(api_url) = api_url {
            let url = url::Url::parse(&api_url).with_context(|| format!("Invalid URL {}", api_url))?;
            let host = url
                .host_str()
                .ok_or_else(|| anyhow::anyhow!("URL {} has no host", api_url))?
                .to_string();
            let tls = url.scheme() == "https";
            let port = url.port_or_known_default().unwrap_or(9090);

            let profile = ServerProfile {
                id: CLI_SERVER_ID.to_string(),
                name: host.clone(),
                host,
                port,
                tls,
                kind: ServerKind::Direct { secret: None },
            };
            self.upsert_server(profile);
            self.default_server = Some(CLI_SERVER_ID.to_string());
        }

        if let Some(s) = secret {
            if let Some(profile) = self.default_profile_mut() {
                if let ServerKind::Direct { secret } = &mut profile.kind {
                    *secret = Some(s);
                }
            }
        }
        Ok(())
    }

    pub fn upsert_server(&mut self, profile: ServerProfile) {
        match self.servers.iter_mut().find(|s| s.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.servers.push(profile),
        }
    }

    pub fn remove_server(&mut self, id: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.id != id);
        if self.default_server.as_deref() == Some(id) {
            self.default_server = None;
        }
        before != self.servers.len()
    }

    /// Server by id or name; the default server when `id` is `None`
    pub fn server(&self, id: Option<&str>) -> Option<&ServerProfile> {
        match id {
            Some(id) => self.servers.iter().find(|s| s.id == id || s.name == id),
            None => self
                .default_server
                .as_deref()
                .and_then(|id| self.servers.iter().find(|s| s.id == id))
                .or_else(|| self.servers.first()),
        }
    }

    fn default_profile_mut(&mut self) -> Option<&mut ServerProfile> {
        let id = self
            .default_server
            .clone()
            .or_else(|| self.servers.first().map(|s| s.id.clone()))?;
        self.servers.iter_mut().find(|s| s.id == id)
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        if self.accept_invalid_certs {
            TrustPolicy::AcceptInvalidCerts
        } else {
            TrustPolicy::Verify
        }
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            backoff_min: Duration::from_millis(self.monitor.backoff_min_ms),
            backoff_max: Duration::from_millis(self.monitor.backoff_max_ms),
            closed_grace_snapshots: self.monitor.closed_grace_snapshots,
            snapshot_interval: Duration::from_millis(self.monitor.snapshot_interval_ms),
        }
    }

    pub fn restart_timing(&self) -> RestartTiming {
        RestartTiming {
            poll_interval: Duration::from_millis(self.restart.poll_interval_ms),
            line_throttle: Duration::from_millis(self.restart.line_throttle_ms),
            max_iterations: self.restart.max_iterations,
            settle_delay: Duration::from_millis(self.restart.settle_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::transport::EndpointAuth;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.servers.is_empty());
        assert_eq!(config.trust_policy(), TrustPolicy::AcceptInvalidCerts);
        assert_eq!(config.restart_timing().max_iterations, 300);
        assert_eq!(config.monitor_options().backoff_max, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
servers:
  - id: home
    name: Home router
    host: 192.168.1.1
    port: 80
    kind:
      type: luci
      plugin: openclash
      username: root
restart:
  max_iterations: 50
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.restart.max_iterations, 50);
        assert_eq!(config.restart.poll_interval_ms, 100);
        assert_eq!(config.logs.buffer_capacity, 1000);
        assert!(config.accept_invalid_certs);
        assert_eq!(config.server(None).unwrap().id, "home");
    }

    #[test]
    fn test_merge_cli_creates_default_server() {
        let mut config = AppConfig::default();
        config
            .merge_cli(
                Some("https://10.0.0.1:9443".to_string()),
                Some("s3cret".to_string()),
            )
            .unwrap();

        let profile = config.server(None).unwrap();
        assert_eq!(profile.id, CLI_SERVER_ID);
        assert_eq!(profile.port, 9443);
        assert!(profile.tls);
        assert_eq!(
            profile.kind,
            ServerKind::Direct {
                secret: Some("s3cret".to_string())
            }
        );
        assert!(config.merge_cli(Some("not a url".to_string()), None).is_err());
    }

    #[test]
    fn test_luci_endpoint_reads_password_from_store() {
        let profile = ServerProfile {
            id: "home".to_string(),
            name: "Home".to_string(),
            host: "192.168.1.1".to_string(),
            port: 80,
            tls: false,
            kind: ServerKind::Luci {
                plugin: PluginKind::MihomoTProxy,
                username: "root".to_string(),
            },
        };
        let store = MemoryCredentialStore::new();
        assert!(profile.endpoint(&store).is_err());

        store.save("home", "root", "pw").unwrap();
        let endpoint = profile.endpoint(&store).unwrap();
        match endpoint.auth {
            EndpointAuth::Luci { password, .. } => assert_eq!(password, "pw"),
            other => panic!("unexpected auth {:?}", other),
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let path = std::env::temp_dir()
            .join(format!("clash-dash-test-{}", std::process::id()))
            .join("config.yaml");
        let mut config = AppConfig::default();
        config.upsert_server(ServerProfile {
            id: "a".to_string(),
            name: "A".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9090,
            tls: false,
            kind: ServerKind::Direct { secret: None },
        });
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.servers, config.servers);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_broken_config_is_not_overwritten() {
        let dir = std::env::temp_dir().join(format!("clash-dash-broken-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let broken = "servers: [this is: not valid\n";
        fs::write(&path, broken).unwrap();

        let result = AppConfig::load_with_cli(
            &path,
            Some("http://10.0.0.1:9090".to_string()),
            Some("s3cret".to_string()),
        );
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), broken);

        fs::remove_file(&path).unwrap();
        let config = AppConfig::load_with_cli(&path, Some("http://10.0.0.1:9090".to_string()), None)
            .unwrap();
        assert_eq!(config.server(None).unwrap().id, CLI_SERVER_ID);
        assert_eq!(AppConfig::load_from(&path).unwrap().servers, config.servers);
        let _ = fs::remove_dir_all(&dir);
    }
}
