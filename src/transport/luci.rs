//! Typed LuCI JSON-RPC calls (`/cgi-bin/luci/rpc/*`) and the plain LuCI
//! endpoints the plugins expose.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AuthSession, Credential, ServerEndpoint, Transport};
use crate::error::TransportError;

/// RPC library mounted under `/cgi-bin/luci/rpc/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcLibrary {
    Auth,
    Sys,
}

impl RpcLibrary {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcLibrary::Auth => "auth",
            RpcLibrary::Sys => "sys",
        }
    }
}

/// JSON-RPC request body
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RpcRequest {
    pub id: u32,
    pub method: String,
    pub params: Vec<String>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Vec<String>) -> Self {
        Self {
            id: 1,
            method: method.to_string(),
            params,
        }
    }

    pub fn login(username: &str, password: &str) -> Self {
        Self::new("login", vec![username.to_string(), password.to_string()])
    }

    pub fn exec(command: &str) -> Self {
        Self::new("exec", vec![command.to_string()])
    }

    pub fn to_value(&self) -> Result<serde_json::Value, TransportError> {
        serde_json::to_value(self).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// JSON-RPC response body
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse<T> {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl<T> RpcResponse<T> {
    /// Result of the call; a non-null `error` member is a decode failure
    pub fn into_result(self) -> Result<Option<T>, TransportError> {
        match self.error {
            Some(err) if !err.is_null() => Err(TransportError::Decode(format!("rpc error: {}", err))),
            _ => Ok(self.result),
        }
    }
}

/// Body of `/cgi-bin/luci/admin/services/openclash/startlog`
#[derive(Debug, Clone, Deserialize)]
pub struct StartLogResponse {
    #[serde(default)]
    pub startlog: String,
}

/// Body of `/cgi-bin/luci/admin/services/openclash/status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OpenWrtStatus {
    pub clash: bool,
    pub web: bool,
    /// Controller address as seen from the router's LAN
    pub daip: String,
    /// Controller secret
    pub dase: String,
    pub cn_port: String,
    pub core_type: String,
    #[serde(rename = "db_foward_port")]
    pub db_forward_port: Option<String>,
    #[serde(rename = "db_foward_domain")]
    pub db_forward_domain: Option<String>,
    pub db_forward_ssl: Option<String>,
    pub watchdog: bool,
}

impl OpenWrtStatus {
    /// Direct controller endpoint OpenClash is serving. An empty `daip`
    /// falls back to the router's own host.
    pub fn controller_endpoint(&self, router: &ServerEndpoint) -> Result<ServerEndpoint, TransportError> {
        let port: u16 = self.cn_port.trim().parse().map_err(|_| {
            TransportError::Decode(format!("invalid controller port '{}'", self.cn_port))
        })?;
        let host = match self.daip.trim() {
            "" => router.host.clone(),
            daip => daip.to_string(),
        };
        let tls = self.db_forward_ssl.as_deref() == Some("1");
        Ok(ServerEndpoint::direct(host, port, Some(self.dase.clone())).with_tls(tls))
    }
}

pub fn rpc_path(library: RpcLibrary, session: &AuthSession) -> String {
    format!("/cgi-bin/luci/rpc/{}?auth={}", library.as_str(), session.token())
}

/// Issue one RPC call
pub async fn call<T: DeserializeOwned>(
    transport: &dyn Transport,
    endpoint: &ServerEndpoint,
    session: &AuthSession,
    library: RpcLibrary,
    request: &RpcRequest,
) -> Result<Option<T>, TransportError> {
    debug!(method = %request.method, library = library.as_str(), "luci rpc call");
    let credential = Credential::Session(session.clone());
    let response = transport
        .request(
            endpoint,
            &credential,
            Method::POST,
            &rpc_path(library, session),
            Some(request.to_value()?),
        )
        .await?;
    response.json::<RpcResponse<T>>()?.into_result()
}

/// Run a shell command on the router and return its stdout
pub async fn exec(
    transport: &dyn Transport,
    endpoint: &ServerEndpoint,
    session: &AuthSession,
    command: &str,
) -> Result<String, TransportError> {
    let output: Option<String> = call(
        transport,
        endpoint,
        session,
        RpcLibrary::Sys,
        &RpcRequest::exec(command),
    )
    .await?;
    Ok(output.unwrap_or_default())
}

pub const NIKKI_CHECK_COMMAND: &str =
    "opkg status luci-app-nikki 2>/dev/null | grep 'Status: install'";

/// Nikki installs under its own package name but is configured as MihomoTProxy
pub async fn is_nikki_installed(
    transport: &dyn Transport,
    endpoint: &ServerEndpoint,
    session: &AuthSession,
) -> Result<bool, TransportError> {
    let output = exec(transport, endpoint, session, NIKKI_CHECK_COMMAND).await?;
    Ok(!output.trim().is_empty())
}

/// Current content of OpenClash's start log
pub async fn fetch_start_log(
    transport: &dyn Transport,
    endpoint: &ServerEndpoint,
    session: &AuthSession,
) -> Result<Vec<String>, TransportError> {
    // the query value only defeats caching on the router side
    let path = format!(
        "/cgi-bin/luci/admin/services/openclash/startlog?{}",
        chrono::Utc::now().timestamp_millis()
    );
    let credential = Credential::Session(session.clone());
    let response = transport
        .request(endpoint, &credential, Method::GET, &path, None)
        .await?;
    let body: StartLogResponse = response.json()?;
    Ok(split_lines(&body.startlog))
}

/// OpenClash's running state, including the controller it exposes
pub async fn fetch_openclash_status(
    transport: &dyn Transport,
    endpoint: &ServerEndpoint,
    session: &AuthSession,
) -> Result<OpenWrtStatus, TransportError> {
    let path = format!(
        "/cgi-bin/luci/admin/services/openclash/status?{}",
        chrono::Utc::now().timestamp_millis()
    );
    let credential = Credential::Session(session.clone());
    let response = transport
        .request(endpoint, &credential, Method::GET, &path, None)
        .await?;
    response.json()
}

pub(crate) fn split_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let value = RpcRequest::login("root", "pw").to_value().unwrap();
        assert_eq!(
            value,
            serde_json::json!({"id": 1, "method": "login", "params": ["root", "pw"]})
        );
    }

    #[test]
    fn test_rpc_path_carries_token() {
        let session = AuthSession::new("tok");
        assert_eq!(
            rpc_path(RpcLibrary::Sys, &session),
            "/cgi-bin/luci/rpc/sys?auth=tok"
        );
    }

    #[test]
    fn test_response_error_member() {
        let ok: RpcResponse<String> =
            serde_json::from_str(r#"{"id":1,"result":"x","error":null}"#).unwrap();
        assert_eq!(ok.into_result().unwrap().as_deref(), Some("x"));

        let failed: RpcResponse<String> =
            serde_json::from_str(r#"{"id":1,"result":null,"error":"denied"}"#).unwrap();
        assert!(matches!(failed.into_result(), Err(TransportError::Decode(_))));

        let empty: RpcResponse<String> = serde_json::from_str(r#"{"id":1}"#).unwrap();
        assert_eq!(empty.into_result().unwrap(), None);
    }

    #[test]
    fn test_status_controller_endpoint() {
        let raw = r#"{"clash":true,"web":true,"daip":"192.168.1.1","dase":"s3cret",
            "cn_port":"9090","core_type":"Meta","db_foward_port":"","db_foward_domain":"",
            "db_forward_ssl":"0","watchdog":true}"#;
        let status: OpenWrtStatus = serde_json::from_str(raw).unwrap();
        assert!(status.clash);
        assert_eq!(status.core_type, "Meta");

        let router = ServerEndpoint::luci("openwrt.lan", 80, "root", "pw", crate::plugin::PluginKind::OpenClash);
        let endpoint = status.controller_endpoint(&router).unwrap();
        assert_eq!(endpoint, ServerEndpoint::direct("192.168.1.1", 9090, Some("s3cret".to_string())));
    }

    #[test]
    fn test_status_falls_back_to_router_host() {
        let status = OpenWrtStatus {
            cn_port: "9093".to_string(),
            db_forward_ssl: Some("1".to_string()),
            ..OpenWrtStatus::default()
        };
        let router = ServerEndpoint::luci("openwrt.lan", 443, "root", "pw", crate::plugin::PluginKind::OpenClash);
        let endpoint = status.controller_endpoint(&router).unwrap();
        assert_eq!(endpoint.host, "openwrt.lan");
        assert_eq!(endpoint.port, 9093);
        assert!(endpoint.tls);
        assert!(!endpoint.is_luci());

        let broken = OpenWrtStatus::default();
        assert!(matches!(broken.controller_endpoint(&router), Err(TransportError::Decode(_))));
    }

    #[test]
    fn test_split_lines_drops_blanks() {
        assert_eq!(
            split_lines("a\n\nb\r\n  \nc"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
