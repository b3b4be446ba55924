use thiserror::Error;

/// Failures while obtaining or using a credential
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("router unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("login session expired, sign in again")]
    SessionExpired,
}

/// Failures of a single request through a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("server returned HTTP {status}")]
    Http { status: u16 },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn decode(err: impl std::fmt::Display) -> Self {
        TransportError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Http {
                status: status.as_u16(),
            }
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Failures of a persistent stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream disconnected: {0}")]
    Disconnected(String),
    #[error("stream protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                StreamError::Disconnected("connection closed".to_string())
            }
            WsError::Io(e) => StreamError::Disconnected(e.to_string()),
            other => StreamError::Protocol(other.to_string()),
        }
    }
}

/// Failures of a control operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("invalid URL")]
    InvalidUrl,
    #[error("unauthorized, check the secret or sign in again")]
    Unauthorized,
    #[error("server error: {0}")]
    ServerError(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0} is not available for this server")]
    Unsupported(&'static str),
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for ControlError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Auth(_) => ControlError::Unauthorized,
            TransportError::Http { status: 401 | 403 } => ControlError::Unauthorized,
            TransportError::Http { status } => ControlError::ServerError(status),
            TransportError::Decode(msg) => ControlError::InvalidResponse(msg),
            TransportError::InvalidUrl(_) => ControlError::InvalidUrl,
            other => ControlError::Transport(other),
        }
    }
}

impl From<url::ParseError> for ControlError {
    fn from(_: url::ParseError) -> Self {
        ControlError::InvalidUrl
    }
}

/// A bounded wait ran out before the expected condition was observed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {iterations} polls")]
pub struct TimeoutError {
    pub iterations: u32,
}
