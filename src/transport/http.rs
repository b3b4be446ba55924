use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client as HttpClient, Method};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, warn};

use super::luci::{RpcLibrary, RpcRequest, RpcResponse};
use super::{
    AuthSession, Credential, EndpointAuth, RawResponse, ServerEndpoint, StreamHandle, Transport,
    TrustPolicy,
};
use crate::error::{AuthError, StreamError, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// reqwest/tungstenite implementation of [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
    trust: TrustPolicy,
}

impl HttpTransport {
    pub fn new(trust: TrustPolicy) -> Result<Self, TransportError> {
        let client = HttpClient::builder()
            .danger_accept_invalid_certs(trust.accepts_invalid())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { client, trust })
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        self.trust
    }

    async fn login(
        &self,
        endpoint: &ServerEndpoint,
        username: &str,
        password: &str,
    ) -> Result<AuthSession, AuthError> {
        let url = endpoint
            .url(&format!("/cgi-bin/luci/rpc/{}", RpcLibrary::Auth.as_str()))
            .map_err(|e| AuthError::NetworkUnreachable(e.to_string()))?;
        debug!(host = %endpoint.host, "logging in to LuCI");

        let response = self
            .client
            .post(url)
            .json(&RpcRequest::login(username, password))
            .send()
            .await
            .map_err(|e| AuthError::NetworkUnreachable(e.to_string()))?;

        if response.status().as_u16() != 200 {
            warn!(status = response.status().as_u16(), "LuCI login rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let body: RpcResponse<String> = response.json().await.map_err(|e| {
            warn!("LuCI login returned an unexpected body: {}", e);
            AuthError::InvalidCredentials
        })?;

        match body.into_result() {
            Ok(Some(token)) if !token.is_empty() => Ok(AuthSession::new(token)),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    fn tls_connector(&self) -> Result<Option<Connector>, StreamError> {
        match self.trust {
            TrustPolicy::Verify => Ok(None),
            TrustPolicy::AcceptInvalidCerts => {
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()
                    .map_err(|e| StreamError::Protocol(e.to_string()))?;
                Ok(Some(Connector::NativeTls(connector)))
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn authenticate(&self, endpoint: &ServerEndpoint) -> Result<Credential, AuthError> {
        match &endpoint.auth {
            EndpointAuth::Token { secret } => Ok(Credential::Bearer(secret.clone())),
            EndpointAuth::Luci {
                username, password, ..
            } => Ok(Credential::Session(
                self.login(endpoint, username, password).await?,
            )),
        }
    }

    async fn request(
        &self,
        endpoint: &ServerEndpoint,
        credential: &Credential,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RawResponse, TransportError> {
        let url = endpoint.url(path)?;
        let mut request = credential.apply(self.client.request(method, url));
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            if let Some(expired) = credential.detect_expired(status) {
                return Err(TransportError::Auth(expired));
            }
            return Err(TransportError::Http { status });
        }

        let body = response.text().await?;
        Ok(RawResponse { status, body })
    }

    async fn open_stream(
        &self,
        endpoint: &ServerEndpoint,
        credential: &Credential,
        path: &str,
        query: &[(String, String)],
    ) -> Result<StreamHandle, StreamError> {
        let secret = match credential {
            Credential::Bearer(secret) => secret.clone(),
            Credential::Session(_) => {
                return Err(StreamError::Protocol(
                    "live streams need a direct controller endpoint".to_string(),
                ))
            }
        };

        let mut query = query.to_vec();
        if let Some(secret) = &secret {
            query.push(("token".to_string(), secret.clone()));
        }
        let url = endpoint.ws_url(path, &query)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(StreamError::from)?;
        if let Some(secret) = &secret {
            let value = HeaderValue::from_str(&format!("Bearer {}", secret))
                .map_err(|e| StreamError::Protocol(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(host = %endpoint.host, path, "opening stream");
        let connector = self.tls_connector()?;
        let (socket, _) = connect_async_tls_with_config(request, None, false, connector).await?;

        let messages = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes).map_err(|e| StreamError::Protocol(e.to_string())),
                ),
                Ok(Message::Close(frame)) => Some(Err(StreamError::Disconnected(
                    frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string()),
                ))),
                Ok(_) => None,
                Err(e) => Some(Err(StreamError::from(e))),
            }
        });

        Ok(StreamHandle::new(messages))
    }
}
