//! Service restart through the router, followed by tailing the plugin's
//! log until it reports a successful start.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::clash::ClashClient;
use crate::error::{ControlError, TimeoutError, TransportError};
use crate::plugin::{LogTail, PluginDriver, PluginKind};
use crate::transport::{luci, AuthSession, ServerEndpoint, Transport};

pub const TIMEOUT_MESSAGE: &str =
    "Timed out waiting for the restart log, check the service status on the router";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPhase {
    Idle,
    Confirming,
    Restarting,
    TailingLog,
    Succeeded,
    TimedOut,
    Failed(String),
}

impl RestartPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RestartPhase::Succeeded | RestartPhase::TimedOut | RestartPhase::Failed(_)
        )
    }
}

/// Progress pushed to the consumer as it happens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartEvent {
    Phase(RestartPhase),
    Line(String),
}

#[derive(Debug, Clone)]
pub struct RestartTiming {
    pub poll_interval: Duration,
    /// Pause after each new line for throttled plugins
    pub line_throttle: Duration,
    pub max_iterations: u32,
    /// Wait after the success marker so trailing lines can arrive
    pub settle_delay: Duration,
}

impl Default for RestartTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            line_throttle: Duration::from_millis(200),
            max_iterations: 300,
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// State of one restart, owned by whoever displays it
#[derive(Debug, Clone)]
pub struct RestartSession {
    phase: RestartPhase,
    lines: Vec<String>,
    seen: HashSet<String>,
    plugin: PluginKind,
    started_at: DateTime<Local>,
}

impl RestartSession {
    pub fn new(plugin: PluginKind) -> Self {
        Self {
            phase: RestartPhase::Idle,
            lines: Vec::new(),
            seen: HashSet::new(),
            plugin,
            started_at: Local::now(),
        }
    }

    /// Move to `Confirming` while the user decides; only valid from `Idle`
    pub fn request_confirmation(&mut self) -> bool {
        if self.phase == RestartPhase::Idle {
            self.phase = RestartPhase::Confirming;
            true
        } else {
            false
        }
    }

    pub fn phase(&self) -> &RestartPhase {
        &self.phase
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn last_line(&self) -> Option<&str> {
        self.lines.last().map(String::as_str)
    }

    pub fn plugin(&self) -> PluginKind {
        self.plugin
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Append a line unless it was already seen
    fn push_line(&mut self, line: &str) -> bool {
        if !self.seen.insert(line.to_string()) {
            return false;
        }
        self.lines.push(line.to_string());
        true
    }
}

/// What the orchestrator drives: a restart trigger and a log to poll
#[async_trait]
pub trait RestartTarget: Send + Sync {
    async fn trigger(&self) -> Result<(), TransportError>;

    /// Whole current log, oldest line first
    async fn fetch_log(&self) -> Result<Vec<String>, TransportError>;

    fn is_success_marker(&self, line: &str) -> bool;

    fn throttles_lines(&self) -> bool;
}

/// Restart through LuCI RPC with the commands of a plugin driver
pub struct LuciRestartTarget<'a> {
    transport: &'a dyn Transport,
    endpoint: &'a ServerEndpoint,
    session: &'a AuthSession,
    driver: Box<dyn PluginDriver>,
}

impl<'a> LuciRestartTarget<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        endpoint: &'a ServerEndpoint,
        session: &'a AuthSession,
        driver: Box<dyn PluginDriver>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            session,
            driver,
        }
    }

    /// Target for the server `client` talks to, resolving its plugin driver
    pub async fn for_client(client: &'a ClashClient) -> Result<Self, ControlError> {
        let driver = client.plugin_driver().await?;
        let session = client.require_session("service restart")?;
        Ok(Self::new(
            client.transport().as_ref(),
            client.endpoint(),
            session,
            driver,
        ))
    }

    pub fn driver(&self) -> &dyn PluginDriver {
        self.driver.as_ref()
    }
}

#[async_trait]
impl<'a> RestartTarget for LuciRestartTarget<'a> {
    async fn trigger(&self) -> Result<(), TransportError> {
        for command in self.driver.restart_commands() {
            debug!(command = %command, "restart command");
            luci::exec(self.transport, self.endpoint, self.session, &command).await?;
        }
        Ok(())
    }

    async fn fetch_log(&self) -> Result<Vec<String>, TransportError> {
        match self.driver.log_tail() {
            LogTail::StartLog => {
                luci::fetch_start_log(self.transport, self.endpoint, self.session).await
            }
            LogTail::Exec(command) => {
                let output =
                    luci::exec(self.transport, self.endpoint, self.session, &command).await?;
                Ok(luci::split_lines(&output))
            }
        }
    }

    fn is_success_marker(&self, line: &str) -> bool {
        self.driver.is_success_marker(line)
    }

    fn throttles_lines(&self) -> bool {
        self.driver.throttles_lines()
    }
}

/// Cancelled through the watch channel
struct Cancelled;

pub struct RestartOrchestrator {
    timing: RestartTiming,
    events: mpsc::UnboundedSender<RestartEvent>,
}

impl RestartOrchestrator {
    pub fn new(timing: RestartTiming, events: mpsc::UnboundedSender<RestartEvent>) -> Self {
        Self { timing, events }
    }

    fn set_phase(&self, session: &mut RestartSession, phase: RestartPhase) {
        info!(plugin = session.plugin.as_str(), phase = ?phase, "restart phase");
        session.phase = phase.clone();
        let _ = self.events.send(RestartEvent::Phase(phase));
    }

    fn push_line(&self, session: &mut RestartSession, line: &str) -> bool {
        if !session.push_line(line) {
            return false;
        }
        let _ = self.events.send(RestartEvent::Line(line.to_string()));
        true
    }

    async fn sleep(
        &self,
        duration: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Cancelled> {
        if *cancel.borrow() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = cancel.changed() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run the restart to a terminal phase. A cancel signal ends it as
    /// `Failed("restart cancelled")` within one polling interval.
    pub async fn run(
        &self,
        session: &mut RestartSession,
        target: &dyn RestartTarget,
        mut cancel: watch::Receiver<bool>,
    ) -> RestartPhase {
        let phase = match self.drive(session, target, &mut cancel).await {
            Ok(Ok(phase)) => phase,
            Ok(Err(e)) => {
                warn!("restart failed: {}", e);
                RestartPhase::Failed(e.to_string())
            }
            Err(Cancelled) => RestartPhase::Failed("restart cancelled".to_string()),
        };
        self.set_phase(session, phase.clone());
        phase
    }

    async fn drive(
        &self,
        session: &mut RestartSession,
        target: &dyn RestartTarget,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Result<RestartPhase, TransportError>, Cancelled> {
        self.set_phase(session, RestartPhase::Restarting);
        let triggered = tokio::select! {
            _ = cancel.changed() => return Err(Cancelled),
            result = target.trigger() => result,
        };
        if let Err(e) = triggered {
            return Ok(Err(e));
        }

        self.set_phase(session, RestartPhase::TailingLog);
        for iteration in 0..self.timing.max_iterations {
            let lines = tokio::select! {
                _ = cancel.changed() => return Err(Cancelled),
                result = target.fetch_log() => result,
            };
            let lines = match lines {
                Ok(lines) => lines,
                Err(e) => return Ok(Err(e)),
            };

            let mut succeeded = false;
            for line in &lines {
                if !self.push_line(session, line) {
                    continue;
                }
                if target.is_success_marker(line) {
                    succeeded = true;
                }
                if target.throttles_lines() {
                    self.sleep(self.timing.line_throttle, cancel).await?;
                }
            }

            if succeeded {
                debug!(iteration, "success marker seen");
                self.sleep(self.timing.settle_delay, cancel).await?;
                let last = tokio::select! {
                    _ = cancel.changed() => return Err(Cancelled),
                    result = target.fetch_log() => result,
                };
                match last {
                    Ok(lines) => {
                        for line in &lines {
                            self.push_line(session, line);
                        }
                    }
                    Err(e) => warn!("final restart log fetch failed: {}", e),
                }
                return Ok(Ok(RestartPhase::Succeeded));
            }

            self.sleep(self.timing.poll_interval, cancel).await?;
        }

        let timeout = TimeoutError {
            iterations: self.timing.max_iterations,
        };
        warn!("restart log tail {}", timeout);
        self.push_line(session, TIMEOUT_MESSAGE);
        Ok(Ok(RestartPhase::TimedOut))
    }
}
