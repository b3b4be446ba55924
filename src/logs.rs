//! Live kernel log over the `/logs` stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clash::LogMessage;
use crate::monitor::Backoff;
use crate::transport::{ServerEndpoint, Transport};

const LOGS_PATH: &str = "/logs";
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Severity filter applied by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "silent" => Some(LogLevel::Silent),
            _ => None,
        }
    }
}

/// Log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

impl LogEntry {
    fn from_message(message: LogMessage) -> Self {
        Self {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            level: message.level.to_uppercase(),
            message: message.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStreamStatus {
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStreamEvent {
    Entry(LogEntry),
    Status(LogStreamStatus),
}

/// Reconnect policy after an unexpected disconnect
#[derive(Debug, Clone)]
pub struct LogReconnect {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for LogReconnect {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[derive(Debug)]
struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    connected: bool,
}

impl LogBuffer {
    fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

type SharedBuffer = Arc<Mutex<LogBuffer>>;

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, LogBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns at most one `/logs` stream and the most recent entries
pub struct LogStreamClient {
    transport: Arc<dyn Transport>,
    reconnect: LogReconnect,
    buffer: SharedBuffer,
    events: mpsc::UnboundedSender<LogStreamEvent>,
    endpoint: Option<ServerEndpoint>,
    level: LogLevel,
    user_paused: bool,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl LogStreamClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        capacity: usize,
        events: mpsc::UnboundedSender<LogStreamEvent>,
    ) -> Self {
        Self {
            transport,
            reconnect: LogReconnect::default(),
            buffer: Arc::new(Mutex::new(LogBuffer {
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
                capacity,
                connected: false,
            })),
            events,
            endpoint: None,
            level: LogLevel::default(),
            user_paused: false,
            shutdown: None,
            task: None,
        }
    }

    pub fn with_reconnect(mut self, reconnect: LogReconnect) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.buffer).connected
    }

    pub fn is_user_paused(&self) -> bool {
        self.user_paused
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Buffered entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.buffer).entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.buffer).entries.clear();
    }

    /// Open the stream at `level`, replacing any stream already open
    pub async fn connect(&mut self, endpoint: ServerEndpoint, level: LogLevel) {
        self.disconnect().await;
        self.endpoint = Some(endpoint.clone());
        self.level = level;
        if self.user_paused {
            debug!("log stream paused by user, not connecting");
            return;
        }

        info!(host = %endpoint.host, level = level.as_str(), "starting log stream");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run_log_stream(
            self.transport.clone(),
            endpoint,
            level,
            self.reconnect.clone(),
            self.buffer.clone(),
            self.events.clone(),
            shutdown_rx,
        )));
    }

    /// Reconnect with a new server-side level filter
    pub async fn set_level(&mut self, level: LogLevel) {
        if level == self.level {
            return;
        }
        self.level = level;
        if let Some(endpoint) = self.endpoint.clone() {
            self.connect(endpoint, level).await;
        }
    }

    /// Close the stream. Safe to call repeatedly; no event is sent by the
    /// stream task after this returns.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.take() {
            handle.abort();
            let _ = handle.await;
            debug!("log stream stopped");
        }
        lock(&self.buffer).connected = false;
    }

    /// Pause (disconnect) or resume; returns whether the user paused
    pub async fn toggle_pause(&mut self) -> bool {
        if self.user_paused {
            self.user_paused = false;
            if let Some(endpoint) = self.endpoint.clone() {
                self.connect(endpoint, self.level).await;
            }
        } else {
            self.user_paused = true;
            self.disconnect().await;
        }
        self.user_paused
    }
}

impl Drop for LogStreamClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

fn decode_entry(text: &str) -> Option<LogEntry> {
    if text == "ping" {
        return None;
    }
    match serde_json::from_str::<LogMessage>(text) {
        Ok(message) => Some(LogEntry::from_message(message)),
        Err(e) => {
            debug!("skipping undecodable log message: {}", e);
            None
        }
    }
}

async fn run_log_stream(
    transport: Arc<dyn Transport>,
    endpoint: ServerEndpoint,
    level: LogLevel,
    reconnect: LogReconnect,
    buffer: SharedBuffer,
    events: mpsc::UnboundedSender<LogStreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let finish = |reason: String| {
        lock(&buffer).connected = false;
        let _ = events.send(LogStreamEvent::Status(LogStreamStatus::Disconnected(reason)));
    };

    if endpoint.is_luci() {
        finish("live logs need a direct controller endpoint".to_string());
        return;
    }

    let credential = tokio::select! {
        _ = shutdown.changed() => return,
        result = transport.authenticate(&endpoint) => result,
    };
    let credential = match credential {
        Ok(credential) => credential,
        Err(e) => {
            finish(e.to_string());
            return;
        }
    };

    let query = vec![("level".to_string(), level.as_str().to_string())];
    let mut backoff = Backoff::new(reconnect.base_delay, reconnect.max_delay);

    loop {
        let opened = tokio::select! {
            _ = shutdown.changed() => return,
            result = transport.open_stream(&endpoint, &credential, LOGS_PATH, &query) => result,
        };

        let reason = match opened {
            Ok(mut stream) => {
                lock(&buffer).connected = true;
                let _ = events.send(LogStreamEvent::Status(LogStreamStatus::Connected));
                loop {
                    let message = tokio::select! {
                        _ = shutdown.changed() => {
                            stream.close();
                            return;
                        }
                        message = stream.next() => message,
                    };
                    match message {
                        Some(Ok(text)) => {
                            if let Some(entry) = decode_entry(&text) {
                                backoff.reset();
                                lock(&buffer).push(entry.clone());
                                let _ = events.send(LogStreamEvent::Entry(entry));
                            }
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        lock(&buffer).connected = false;
        if backoff.attempts() >= reconnect.max_attempts {
            warn!("log stream giving up after {} attempts: {}", backoff.attempts(), reason);
            finish(reason);
            return;
        }

        let delay = backoff.next_delay();
        warn!(
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "log stream lost: {}",
            reason
        );
        let _ = events.send(LogStreamEvent::Status(LogStreamStatus::Reconnecting {
            attempt: backoff.attempts(),
            delay,
        }));

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
