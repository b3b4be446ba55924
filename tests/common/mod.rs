#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clash_dash::error::{AuthError, StreamError, TransportError};
use clash_dash::transport::{
    AuthSession, Credential, EndpointAuth, RawResponse, ServerEndpoint, StreamHandle, Transport,
};
use reqwest::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// One call seen by [`FakeTransport`]
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

/// One stream opened through [`FakeTransport`]
#[derive(Debug, Clone)]
pub struct StreamOpen {
    pub path: String,
    pub query: Vec<(String, String)>,
}

type Handler =
    Box<dyn Fn(&Method, &str, Option<&serde_json::Value>) -> Result<RawResponse, TransportError> + Send + Sync>;

type ScriptedStream = Result<mpsc::UnboundedReceiver<Result<String, StreamError>>, StreamError>;

/// In-memory transport: requests go to a handler, streams come from a queue
pub struct FakeTransport {
    handler: Handler,
    auth_error: Mutex<Option<AuthError>>,
    calls: Mutex<Vec<Call>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    opens: Mutex<Vec<StreamOpen>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_handler(|_, _, _| Ok(ok("")))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Method, &str, Option<&serde_json::Value>) -> Result<RawResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            auth_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
            opens: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_auth(&self, error: AuthError) {
        *self.auth_error.lock().unwrap() = Some(error);
    }

    /// Queue a stream for the next `open_stream`; feed it through the sender
    pub fn push_stream(&self) -> mpsc::UnboundedSender<Result<String, StreamError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(Ok(rx));
        tx
    }

    pub fn push_stream_error(&self, error: StreamError) {
        self.streams.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    pub fn opens(&self) -> Vec<StreamOpen> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn authenticate(&self, endpoint: &ServerEndpoint) -> Result<Credential, AuthError> {
        if let Some(error) = self.auth_error.lock().unwrap().clone() {
            return Err(error);
        }
        match &endpoint.auth {
            EndpointAuth::Token { secret } => Ok(Credential::Bearer(secret.clone())),
            EndpointAuth::Luci { .. } => Ok(Credential::Session(AuthSession::new("tok"))),
        }
    }

    async fn request(
        &self,
        _endpoint: &ServerEndpoint,
        _credential: &Credential,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap().push(Call {
            method: method.clone(),
            path: path.to_string(),
            body: body.clone(),
        });
        (self.handler)(&method, path, body.as_ref())
    }

    async fn open_stream(
        &self,
        _endpoint: &ServerEndpoint,
        _credential: &Credential,
        path: &str,
        query: &[(String, String)],
    ) -> Result<StreamHandle, StreamError> {
        self.opens.lock().unwrap().push(StreamOpen {
            path: path.to_string(),
            query: query.to_vec(),
        });
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(Ok(rx)) => Ok(StreamHandle::new(futures_util::stream::unfold(
                rx,
                |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
            ))),
            Some(Err(e)) => Err(e),
            None => Err(StreamError::Disconnected("no stream scripted".to_string())),
        }
    }
}

pub fn ok(body: &str) -> RawResponse {
    RawResponse {
        status: 200,
        body: body.to_string(),
    }
}

/// JSON-RPC reply the way LuCI shapes it
pub fn rpc_result(result: &str) -> RawResponse {
    ok(&serde_json::json!({ "id": 1, "result": result, "error": null }).to_string())
}

/// Shell command carried by an `exec` RPC body
pub fn exec_command(body: Option<&serde_json::Value>) -> Option<String> {
    let body = body?;
    if body["method"] != "exec" {
        return None;
    }
    body["params"][0].as_str().map(str::to_string)
}

pub fn direct_endpoint() -> ServerEndpoint {
    ServerEndpoint::direct("127.0.0.1", 9090, Some("s3cret".to_string()))
}

/// Wait (at most 10s of runtime time) for a value matching `pred`
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                panic!("publisher dropped");
            }
        }
    })
    .await;
    waited.expect("timed out waiting for a matching value")
}

/// Request as seen by [`HttpResponder`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Minimal HTTP/1.1 server answering each request with `(status, body)`
pub struct HttpResponder {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl HttpResponder {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&RecordedRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let recorded = recorded.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut socket).await else {
                        return;
                    };
                    let (status, body) = respond(&request);
                    recorded.lock().unwrap().push(request);
                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { port, requests }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    Some(RecordedRequest {
        method,
        target,
        headers,
        body,
    })
}
