//! Uniform access to a Clash core, either directly through its external
//! controller or through the LuCI RPC interface of the router it runs on.

pub mod http;
pub mod luci;

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{AuthError, StreamError, TransportError};
use crate::plugin::PluginKind;

pub use http::HttpTransport;

/// How a server proves who we are
#[derive(Clone, PartialEq, Eq)]
pub enum EndpointAuth {
    /// External controller secret, sent as a bearer token
    Token { secret: Option<String> },
    /// Router login, exchanged for a LuCI session
    Luci {
        username: String,
        password: String,
        plugin: PluginKind,
    },
}

impl fmt::Debug for EndpointAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAuth::Token { secret } => f
                .debug_struct("Token")
                .field("secret", &secret.as_ref().map(|_| "***"))
                .finish(),
            EndpointAuth::Luci {
                username, plugin, ..
            } => f
                .debug_struct("Luci")
                .field("username", username)
                .field("password", &"***")
                .field("plugin", plugin)
                .finish(),
        }
    }
}

/// A controllable backend. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub auth: EndpointAuth,
}

impl ServerEndpoint {
    /// Endpoint for a Clash external controller
    pub fn direct(host: impl Into<String>, port: u16, secret: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            auth: EndpointAuth::Token {
                secret: secret.filter(|s| !s.is_empty()),
            },
        }
    }

    /// Endpoint for a router running one of the LuCI plugins
    pub fn luci(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        plugin: PluginKind,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            auth: EndpointAuth::Luci {
                username: username.into(),
                password: password.into(),
                plugin,
            },
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn is_luci(&self) -> bool {
        matches!(self.auth, EndpointAuth::Luci { .. })
    }

    pub fn plugin(&self) -> Option<PluginKind> {
        match &self.auth {
            EndpointAuth::Luci { plugin, .. } => Some(*plugin),
            EndpointAuth::Token { .. } => None,
        }
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Resolve a path (optionally carrying a query) against this endpoint
    pub fn url(&self, path: &str) -> Result<Url, TransportError> {
        let raw = format!("{}{}", self.base_url(), path);
        Url::parse(&raw).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", raw, e)))
    }

    /// WebSocket URL for a streaming path
    pub fn ws_url(&self, path: &str, query: &[(String, String)]) -> Result<Url, StreamError> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let raw = format!("{}://{}:{}{}", scheme, self.host, self.port, path);
        let mut url = Url::parse(&raw)
            .map_err(|e| StreamError::Protocol(format!("invalid stream URL {}: {}", raw, e)))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// LuCI session obtained by a login RPC. The server may drop it at any time.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    token: String,
}

impl AuthSession {
    pub const COOKIE_NAMES: [&'static str; 2] = ["sysauth", "sysauth_http"];

    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub(crate) fn cookie_header(&self) -> String {
        Self::COOKIE_NAMES
            .iter()
            .map(|name| format!("{}={}", name, self.token))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession").field("token", &"***").finish()
    }
}

/// Result of `Transport::authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(Option<String>),
    Session(AuthSession),
}

impl Credential {
    /// Attach the header or cookie this credential needs
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credential::Bearer(Some(secret)) => request.bearer_auth(secret),
            Credential::Bearer(None) => request,
            Credential::Session(session) => {
                request.header(reqwest::header::COOKIE, session.cookie_header())
            }
        }
    }

    pub fn session(&self) -> Option<&AuthSession> {
        match self {
            Credential::Session(session) => Some(session),
            Credential::Bearer(_) => None,
        }
    }

    /// Recognize a status meaning the credential is no longer accepted
    pub fn detect_expired(&self, status: u16) -> Option<AuthError> {
        match (self, status) {
            (Credential::Session(_), 401 | 403) => Some(AuthError::SessionExpired),
            _ => None,
        }
    }
}

/// Whether TLS certificates presented by the server are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Routers on the LAN serve self-signed certificates
    #[default]
    AcceptInvalidCerts,
    Verify,
}

impl TrustPolicy {
    pub fn accepts_invalid(&self) -> bool {
        matches!(self, TrustPolicy::AcceptInvalidCerts)
    }
}

/// Status and body of a successful (2xx) response
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(TransportError::decode)
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

/// Open stream of raw text messages. Dropping or closing it closes the socket.
pub struct StreamHandle {
    inner: MessageStream,
}

impl StreamHandle {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<String, StreamError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub fn close(self) {
        drop(self.inner);
    }
}

impl Stream for StreamHandle {
    type Item = Result<String, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamHandle")
    }
}

/// Capability set shared by both backend styles
#[async_trait]
pub trait Transport: Send + Sync {
    async fn authenticate(&self, endpoint: &ServerEndpoint) -> Result<Credential, AuthError>;

    async fn request(
        &self,
        endpoint: &ServerEndpoint,
        credential: &Credential,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RawResponse, TransportError>;

    async fn open_stream(
        &self,
        endpoint: &ServerEndpoint,
        credential: &Credential,
        path: &str,
        query: &[(String, String)],
    ) -> Result<StreamHandle, StreamError>;
}
