use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::types::*;
use crate::error::{AuthError, ControlError};
use crate::plugin::{self, PluginDriver, PluginKind};
use crate::transport::{luci, AuthSession, Credential, RawResponse, ServerEndpoint, Transport};

/// Installed plugin and its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginVersion {
    pub plugin_name: String,
    pub version: String,
}

impl PluginVersion {
    pub fn display_version(&self) -> String {
        format!("{} {}", self.plugin_name, self.version)
    }
}

/// Result of probing a server's `/version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Ok { version: String, server_type: ServerType },
    Unauthorized,
    Error(String),
}

/// Control operations against one server. Each call is a single
/// request/response; failures go back to the caller untouched.
#[derive(Clone)]
pub struct ClashClient {
    transport: Arc<dyn Transport>,
    endpoint: ServerEndpoint,
    credential: Credential,
}

impl std::fmt::Debug for ClashClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClashClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl ClashClient {
    pub fn new(transport: Arc<dyn Transport>, endpoint: ServerEndpoint, credential: Credential) -> Self {
        Self {
            transport,
            endpoint,
            credential,
        }
    }

    /// Authenticate against the endpoint and build a client from the result
    pub async fn connect(
        transport: Arc<dyn Transport>,
        endpoint: ServerEndpoint,
    ) -> Result<Self, AuthError> {
        let credential = transport.authenticate(&endpoint).await?;
        Ok(Self::new(transport, endpoint, credential))
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn require_direct(&self, operation: &'static str) -> Result<(), ControlError> {
        match self.credential {
            Credential::Bearer(_) => Ok(()),
            Credential::Session(_) => Err(ControlError::Unsupported(operation)),
        }
    }

    pub(crate) fn require_session(
        &self,
        operation: &'static str,
    ) -> Result<&AuthSession, ControlError> {
        self.credential
            .session()
            .ok_or(ControlError::Unsupported(operation))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RawResponse, ControlError> {
        debug!(%method, path, "clash api request");
        Ok(self
            .transport
            .request(&self.endpoint, &self.credential, method, path, body)
            .await?)
    }

    /// Make a GET request
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlError> {
        Ok(self.send(Method::GET, path, None).await?.json()?)
    }

    /// Test connection to Clash API
    pub async fn test_connection(&self) -> Result<(), ControlError> {
        self.get_version().await?;
        Ok(())
    }

    pub async fn get_version(&self) -> Result<VersionResponse, ControlError> {
        self.require_direct("version")?;
        self.get("/version").await
    }

    /// Classify the server from its `/version` answer
    pub async fn check_status(&self) -> ServerStatus {
        match self.get_version().await {
            Ok(version) => ServerStatus::Ok {
                server_type: version.server_type(),
                version: version.version,
            },
            Err(ControlError::Unauthorized) => ServerStatus::Unauthorized,
            Err(e) => ServerStatus::Error(e.to_string()),
        }
    }

    /// Get Clash configuration
    pub async fn get_config(&self) -> Result<ConfigResponse, ControlError> {
        self.require_direct("configs")?;
        self.get("/configs").await
    }

    pub async fn get_mode(&self) -> Result<ClashMode, ControlError> {
        let config = self.get_config().await?;
        config
            .clash_mode()
            .ok_or_else(|| ControlError::InvalidResponse(format!("unknown mode '{}'", config.mode)))
    }

    pub async fn set_mode(&self, mode: ClashMode) -> Result<(), ControlError> {
        self.patch_config("mode", serde_json::json!(mode.as_str()))
            .await?;
        info!(mode = mode.as_str(), "switched mode");
        Ok(())
    }

    /// Patch one configuration key (ports, allow-lan, log-level, tun, ...)
    pub async fn patch_config(&self, key: &str, value: serde_json::Value) -> Result<(), ControlError> {
        self.require_direct("config patch")?;
        let mut body = serde_json::Map::new();
        body.insert(key.to_string(), value);
        self.send(Method::PATCH, "/configs", Some(serde_json::Value::Object(body)))
            .await?;
        Ok(())
    }

    /// Get all proxies
    pub async fn get_proxies(&self) -> Result<ProxiesResponse, ControlError> {
        self.require_direct("proxies")?;
        self.get("/proxies").await
    }

    /// Switch proxy selector to a specific proxy
    pub async fn select_proxy(&self, group: &str, proxy: &str) -> Result<(), ControlError> {
        self.require_direct("proxy selection")?;
        let path = format!("/proxies/{}", urlencoding::encode(group));
        self.send(Method::PUT, &path, Some(serde_json::json!({ "name": proxy })))
            .await?;
        Ok(())
    }

    /// Test proxy delay
    pub async fn test_delay(
        &self,
        proxy: &str,
        test_url: &str,
        timeout_ms: u32,
    ) -> Result<DelayResponse, ControlError> {
        self.require_direct("delay test")?;
        let path = format!(
            "/proxies/{}/delay?url={}&timeout={}",
            urlencoding::encode(proxy),
            urlencoding::encode(test_url),
            timeout_ms
        );
        self.get(&path).await
    }

    /// Get providers
    pub async fn get_providers(&self) -> Result<ProvidersResponse, ControlError> {
        self.require_direct("providers")?;
        self.get("/providers/proxies").await
    }

    /// Update provider
    pub async fn update_provider(&self, name: &str) -> Result<(), ControlError> {
        self.require_direct("provider update")?;
        let path = format!("/providers/proxies/{}", urlencoding::encode(name));
        self.send(Method::PUT, &path, None).await?;
        Ok(())
    }

    pub async fn health_check_provider(&self, name: &str) -> Result<(), ControlError> {
        self.require_direct("provider health check")?;
        let path = format!("/providers/proxies/{}/healthcheck", urlencoding::encode(name));
        self.send(Method::GET, &path, None).await?;
        Ok(())
    }

    pub async fn reload_config(&self) -> Result<(), ControlError> {
        self.require_direct("config reload")?;
        self.send(
            Method::PUT,
            "/configs?force=true",
            Some(serde_json::json!({ "path": "", "payload": "" })),
        )
        .await?;
        Ok(())
    }

    pub async fn update_geo_database(&self) -> Result<(), ControlError> {
        self.require_direct("geo database update")?;
        self.send(Method::POST, "/configs/geo", Some(serde_json::json!({})))
            .await?;
        Ok(())
    }

    pub async fn clear_fake_ip(&self) -> Result<(), ControlError> {
        self.require_direct("fake-ip flush")?;
        self.send(Method::POST, "/cache/fakeip/flush", None).await?;
        Ok(())
    }

    pub async fn restart_core(&self) -> Result<(), ControlError> {
        self.require_direct("core restart")?;
        self.send(
            Method::POST,
            "/restart",
            Some(serde_json::json!({ "path": "", "payload": "" })),
        )
        .await?;
        Ok(())
    }

    pub async fn upgrade_core(&self) -> Result<(), ControlError> {
        self.require_direct("core upgrade")?;
        self.send(Method::POST, "/upgrade", Some(serde_json::json!({})))
            .await?;
        Ok(())
    }

    /// Close a specific connection
    pub async fn close_connection(&self, id: &str) -> Result<(), ControlError> {
        self.require_direct("connection close")?;
        let path = format!("/connections/{}", urlencoding::encode(id));
        self.send(Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Close all connections
    pub async fn close_all_connections(&self) -> Result<(), ControlError> {
        self.require_direct("connection close")?;
        self.send(Method::DELETE, "/connections", None).await?;
        Ok(())
    }

    /// Run a shell command on the router (LuCI servers only)
    pub async fn exec(&self, command: &str) -> Result<String, ControlError> {
        let session = self.require_session("remote command")?;
        Ok(luci::exec(self.transport.as_ref(), &self.endpoint, session, command).await?)
    }

    /// Driver for this server's plugin, with Nikki detection
    pub async fn plugin_driver(&self) -> Result<Box<dyn PluginDriver>, ControlError> {
        let session = self.require_session("plugin detection")?;
        let kind = self
            .endpoint
            .plugin()
            .ok_or(ControlError::Unsupported("plugin detection"))?;
        Ok(plugin::resolve_driver(self.transport.as_ref(), &self.endpoint, session, kind).await?)
    }

    pub async fn get_plugin_version(&self) -> Result<PluginVersion, ControlError> {
        let driver = self.plugin_driver().await?;
        let output = self.exec(&driver.version_command()).await?;
        let version = PluginVersion {
            plugin_name: driver.display_name().to_string(),
            version: output.trim().to_string(),
        };
        info!(version = %version.display_version(), "plugin version");
        Ok(version)
    }

    /// Direct controller endpoint behind an OpenClash router, read from the
    /// plugin's status page. Streams need this endpoint.
    pub async fn controller_endpoint(&self) -> Result<ServerEndpoint, ControlError> {
        let session = self.require_session("controller lookup")?;
        if self.endpoint.plugin() != Some(PluginKind::OpenClash) {
            return Err(ControlError::Unsupported("controller lookup"));
        }
        let status =
            luci::fetch_openclash_status(self.transport.as_ref(), &self.endpoint, session).await?;
        if !status.clash {
            warn!("OpenClash reports the core is not running");
        }
        let endpoint = status.controller_endpoint(&self.endpoint)?;
        debug!(host = %endpoint.host, port = endpoint.port, "resolved controller endpoint");
        Ok(endpoint)
    }
}
