//! Live connection list fed by the `/connections` stream.
//!
//! [`ConnectionMonitor`] owns one stream task at a time. The task merges
//! every snapshot into a [`ConnectionBook`] and publishes a filtered
//! [`MonitorView`] through a `watch` channel. Stream failures are retried
//! with exponential backoff until [`ConnectionMonitor::stop`] is called.

mod backoff;
mod filter;
mod record;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use backoff::Backoff;
pub use filter::{ConnectionFilter, SortKey, StateFilter};
pub use record::{AggregateStats, ConnectionBook, ConnectionRecord};

use crate::clash::{ClashClient, ConnectionsResponse};
use crate::error::ControlError;
use crate::transport::{Credential, ServerEndpoint, Transport};

const CONNECTIONS_PATH: &str = "/connections";

/// Connection state of the monitor as seen by consumers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MonitorStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, reason: String },
    Failed(String),
}

impl MonitorStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, MonitorStatus::Connected)
    }
}

/// Everything a consumer renders, published as one value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorView {
    pub status: MonitorStatus,
    pub paused: bool,
    pub connections: Vec<ConnectionRecord>,
    pub aggregate: AggregateStats,
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Snapshots a closed connection keeps its rate baseline
    pub closed_grace_snapshots: u32,
    /// Push interval requested from the core
    pub snapshot_interval: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            closed_grace_snapshots: 1,
            snapshot_interval: Duration::from_secs(1),
        }
    }
}

struct MonitorState {
    book: ConnectionBook,
    filter: ConnectionFilter,
    status: MonitorStatus,
    paused: bool,
    running: bool,
    endpoint: Option<ServerEndpoint>,
    credential: Option<Credential>,
}

impl MonitorState {
    fn view(&self) -> MonitorView {
        MonitorView {
            status: self.status.clone(),
            paused: self.paused,
            connections: self.book.view(&self.filter),
            aggregate: self.book.aggregate().clone(),
        }
    }
}

struct Shared {
    state: Mutex<MonitorState>,
    view_tx: watch::Sender<MonitorView>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the state and publish while still holding the lock, so a
    /// publish can never land after `running` was cleared.
    fn update<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        if state.running {
            self.view_tx.send_replace(state.view());
        }
        result
    }

    fn set_status(&self, status: MonitorStatus) {
        self.update(|state| state.status = status);
    }
}

pub struct ConnectionMonitor {
    transport: Arc<dyn Transport>,
    options: MonitorOptions,
    shared: Arc<Shared>,
    view_rx: watch::Receiver<MonitorView>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionMonitor {
    pub fn new(transport: Arc<dyn Transport>, options: MonitorOptions) -> Self {
        let (view_tx, view_rx) = watch::channel(MonitorView::default());
        let state = MonitorState {
            book: ConnectionBook::new(options.closed_grace_snapshots),
            filter: ConnectionFilter::default(),
            status: MonitorStatus::Idle,
            paused: false,
            running: false,
            endpoint: None,
            credential: None,
        };
        Self {
            transport,
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                view_tx,
            }),
            view_rx,
            shutdown: None,
            task: None,
        }
    }

    /// Receiver of every published view
    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.view_rx.clone()
    }

    /// Latest published view
    pub fn view(&self) -> MonitorView {
        self.view_rx.borrow().clone()
    }

    pub fn status(&self) -> MonitorStatus {
        self.shared.lock().status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Start monitoring `endpoint`. A no-op when already monitoring the
    /// same endpoint; a different endpoint replaces the running stream.
    pub async fn start(&mut self, endpoint: ServerEndpoint) {
        if self.task.is_some() {
            let same = self.shared.lock().endpoint.as_ref() == Some(&endpoint);
            if same {
                return;
            }
            self.stop().await;
        }

        info!(host = %endpoint.host, port = endpoint.port, "starting connection monitor");
        self.shared.update(|state| {
            state.running = true;
            state.status = MonitorStatus::Connecting;
            state.endpoint = Some(endpoint.clone());
            state.credential = None;
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run_stream(
            self.shared.clone(),
            self.transport.clone(),
            endpoint,
            self.options.clone(),
            shutdown_rx,
        )));
    }

    /// Tear down the stream and release rate state. Safe from any state;
    /// nothing is published after this returns.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.take() {
            handle.abort();
            let _ = handle.await;
        }

        let mut state = self.shared.lock();
        if state.running {
            debug!("connection monitor stopped");
        }
        state.book.reset();
        state.status = MonitorStatus::Idle;
        state.credential = None;
        if state.running {
            self.shared.view_tx.send_replace(state.view());
        }
        state.running = false;
    }

    /// Flip the pause flag; returns the new value
    pub fn toggle_pause(&self) -> bool {
        self.shared.update(|state| {
            state.paused = !state.paused;
            state.paused
        })
    }

    pub fn set_filter(&self, filter: ConnectionFilter) {
        self.shared.update(|state| state.filter = filter);
    }

    pub fn filter(&self) -> ConnectionFilter {
        self.shared.lock().filter.clone()
    }

    fn control_client(&self) -> Result<ClashClient, ControlError> {
        let state = self.shared.lock();
        match (&state.endpoint, &state.credential) {
            (Some(endpoint), Some(credential)) => Ok(ClashClient::new(
                self.transport.clone(),
                endpoint.clone(),
                credential.clone(),
            )),
            _ => Err(ControlError::Unsupported(
                "closing connections before the monitor connects",
            )),
        }
    }

    /// Ask the core to close one connection, then mark it closed locally
    pub async fn close_connection(&self, id: &str) -> Result<(), ControlError> {
        self.control_client()?.close_connection(id).await?;
        self.shared.update(|state| {
            state.book.mark_closed(id);
        });
        Ok(())
    }

    pub async fn close_all(&self) -> Result<(), ControlError> {
        self.control_client()?.close_all_connections().await?;
        self.shared.update(|state| state.book.mark_all_closed());
        Ok(())
    }

    /// Forget closed connections; returns how many were removed
    pub fn clear_closed(&self) -> usize {
        self.shared.update(|state| state.book.clear_closed())
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

fn decode_snapshot(text: &str) -> Option<ConnectionsResponse> {
    match serde_json::from_str(text) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("skipping malformed connections snapshot: {}", e);
            None
        }
    }
}

async fn run_stream(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    endpoint: ServerEndpoint,
    options: MonitorOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    if endpoint.is_luci() {
        shared.set_status(MonitorStatus::Failed(
            "live connections need a direct controller endpoint".to_string(),
        ));
        return;
    }

    let credential = tokio::select! {
        _ = shutdown.changed() => return,
        result = transport.authenticate(&endpoint) => result,
    };
    let credential = match credential {
        Ok(credential) => credential,
        Err(e) => {
            warn!("connection monitor authentication failed: {}", e);
            shared.set_status(MonitorStatus::Failed(e.to_string()));
            return;
        }
    };
    shared.update(|state| state.credential = Some(credential.clone()));

    let query = vec![(
        "interval".to_string(),
        options.snapshot_interval.as_millis().to_string(),
    )];
    let mut backoff = Backoff::new(options.backoff_min, options.backoff_max);

    loop {
        let opened = tokio::select! {
            _ = shutdown.changed() => return,
            result = transport.open_stream(&endpoint, &credential, CONNECTIONS_PATH, &query) => result,
        };

        let reason = match opened {
            Ok(mut stream) => {
                debug!("connections stream open");
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
                            let Some(snapshot) = decode_snapshot(&text) else {
                                continue;
                            };
                            backoff.reset();
                            let now = Instant::now();
                            shared.update(|state| {
                                state.status = MonitorStatus::Connected;
                                if !state.paused {
                                    state.book.apply(snapshot, now);
                                }
                            });
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        let delay = backoff.next_delay();
        warn!(
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "connections stream lost: {}",
            reason
        );
        shared.set_status(MonitorStatus::Reconnecting {
            attempt: backoff.attempts(),
            reason,
        });

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
