//! Plugin and kernel log files on the router, read and cleared over LuCI RPC.

use std::sync::OnceLock;

use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use tracing::{debug, info};

use crate::clash::ClashClient;
use crate::error::ControlError;
use crate::plugin::ServiceLogKind;
use crate::transport::luci;

/// Lines requested from the end of a log file
pub const MAX_LOG_LINES: usize = 1000;

const PLUGIN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One parsed log line; times are router-local
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLogEntry {
    pub timestamp: NaiveDateTime,
    pub level: ServiceLogLevel,
    pub message: String,
}

fn bracketed_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\] \[([^\]]+)\] (.*)$").ok()
    })
    .as_ref()
}

fn kernel_field(name: &str) -> Option<&'static Regex> {
    static TIME: OnceLock<Option<Regex>> = OnceLock::new();
    static MSG: OnceLock<Option<Regex>> = OnceLock::new();
    static LEVEL: OnceLock<Option<Regex>> = OnceLock::new();
    let (cell, pattern) = match name {
        "time" => (&TIME, r#"time="([^"]+)""#),
        "msg" => (&MSG, r#"msg="((?:[^"\\]|\\.)*)""#),
        _ => (&LEVEL, r"level=(\w+)"),
    };
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn level_from_text(message: &str) -> Option<ServiceLogLevel> {
    let lower = message.to_lowercase();
    if lower.contains("error") {
        Some(ServiceLogLevel::Error)
    } else if lower.contains("warning") {
        Some(ServiceLogLevel::Warning)
    } else {
        None
    }
}

/// `2025-01-10 17:04:32 Step 5: Set Dnsmasq...`
pub fn parse_plugin_line(line: &str) -> Option<ServiceLogEntry> {
    if line.starts_with('[') {
        return parse_bracketed_line(line);
    }
    let mut parts = line.splitn(3, ' ');
    let date = parts.next()?;
    let time = parts.next()?;
    let message = parts.next()?.trim();
    let timestamp =
        NaiveDateTime::parse_from_str(&format!("{} {}", date, time), PLUGIN_TIME_FORMAT).ok()?;

    let level = level_from_text(message).unwrap_or_else(|| {
        if message.to_lowercase().contains("tip") {
            ServiceLogLevel::Info
        } else {
            ServiceLogLevel::Debug
        }
    });
    Some(ServiceLogEntry {
        timestamp,
        level,
        message: message.to_string(),
    })
}

/// `[2025-01-10 19:18:35] [App] Enabled.`
pub fn parse_bracketed_line(line: &str) -> Option<ServiceLogEntry> {
    let captures = bracketed_line()?.captures(line)?;
    let timestamp = NaiveDateTime::parse_from_str(&captures[1], PLUGIN_TIME_FORMAT).ok()?;
    let component = &captures[2];
    let message = format!("{}: {}", component, &captures[3]);

    let level = level_from_text(&message).unwrap_or(if component == "App" {
        ServiceLogLevel::Info
    } else {
        ServiceLogLevel::Debug
    });
    Some(ServiceLogEntry {
        timestamp,
        level,
        message,
    })
}

/// `time="2025-01-10T09:04:34.913541326Z" level=info msg="Start initial configuration in progress"`
pub fn parse_kernel_line(line: &str) -> Option<ServiceLogEntry> {
    let time = kernel_field("time")?.captures(line)?;
    let timestamp = DateTime::parse_from_rfc3339(&time[1])
        .ok()?
        .with_timezone(&Local)
        .naive_local();

    let message = kernel_field("msg")?.captures(line)?[1].replace("\\\"", "\"");

    let level = match kernel_field("level")
        .and_then(|re| re.captures(line))
        .map(|c| c[1].to_lowercase())
        .as_deref()
    {
        Some("error") | Some("fatal") => ServiceLogLevel::Error,
        Some("warn") | Some("warning") => ServiceLogLevel::Warning,
        Some("info") => ServiceLogLevel::Info,
        _ => ServiceLogLevel::Debug,
    };
    Some(ServiceLogEntry {
        timestamp,
        level,
        message,
    })
}

/// Parse whatever lines of `raw` belong to `kind`, skipping the rest
pub fn parse_service_log(
    raw: &str,
    kind: ServiceLogKind,
    kernel_lines: Option<bool>,
) -> Vec<ServiceLogEntry> {
    let entries: Vec<ServiceLogEntry> = luci::split_lines(raw)
        .iter()
        .filter(|line| match kernel_lines {
            Some(wanted) => line.contains("time=") == wanted,
            None => true,
        })
        .filter_map(|line| match kind {
            ServiceLogKind::Plugin => parse_plugin_line(line),
            ServiceLogKind::Kernel => parse_kernel_line(line),
        })
        .collect();

    let skip = entries.len().saturating_sub(MAX_LOG_LINES);
    entries.into_iter().skip(skip).collect()
}

/// Most recent entries of the plugin or kernel log
pub async fn fetch_service_log(
    client: &ClashClient,
    kind: ServiceLogKind,
) -> Result<Vec<ServiceLogEntry>, ControlError> {
    let driver = client.plugin_driver().await?;
    let source = driver.service_log(kind);
    debug!(path = %source.path, "fetching service log");

    let output = client
        .exec(&format!("tail -n {} {}", MAX_LOG_LINES, source.path))
        .await?;
    Ok(parse_service_log(&output, kind, source.kernel_lines))
}

pub async fn clear_service_log(client: &ClashClient, kind: ServiceLogKind) -> Result<(), ControlError> {
    let driver = client.plugin_driver().await?;
    client.exec(&driver.clear_log_command(kind)).await?;
    info!(plugin = driver.display_name(), ?kind, "cleared service log");
    Ok(())
}
