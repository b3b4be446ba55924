//! Router-side packages that host the core. Every place that behaves
//! differently per package goes through a [`PluginDriver`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::transport::{luci, AuthSession, ServerEndpoint, Transport};

/// Which LuCI package exposes the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    #[serde(rename = "openclash")]
    OpenClash,
    #[serde(rename = "mihomo_tproxy")]
    MihomoTProxy,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::OpenClash => "openclash",
            PluginKind::MihomoTProxy => "mihomo_tproxy",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openclash" => Some(PluginKind::OpenClash),
            "mihomo_tproxy" | "mihomotproxy" | "mihomo" | "nikki" => Some(PluginKind::MihomoTProxy),
            _ => None,
        }
    }
}

/// Where the restart orchestrator reads progress from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTail {
    /// OpenClash's dedicated start-log endpoint
    StartLog,
    /// Cumulative log file read with a shell command
    Exec(String),
}

/// Which service log to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLogKind {
    Plugin,
    Kernel,
}

/// How to read one service log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLogSource {
    pub path: String,
    /// Lines must (true) or must not (false) contain `time=`; `None` keeps all
    pub kernel_lines: Option<bool>,
}

/// Commands and markers specific to one router package
pub trait PluginDriver: Send + Sync + fmt::Debug {
    fn kind(&self) -> PluginKind;

    fn display_name(&self) -> &'static str;

    /// Shell commands run in order to trigger a restart
    fn restart_commands(&self) -> Vec<String>;

    fn log_tail(&self) -> LogTail;

    /// Line that tells the service finished starting
    fn is_success_marker(&self, line: &str) -> bool;

    fn version_command(&self) -> String;

    /// Whether new tail lines are released one at a time
    fn throttles_lines(&self) -> bool;

    fn service_log(&self, kind: ServiceLogKind) -> ServiceLogSource;

    fn clear_log_command(&self, kind: ServiceLogKind) -> String;
}

const OPENCLASH_LOG: &str = "/tmp/openclash.log";

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenClashDriver;

impl PluginDriver for OpenClashDriver {
    fn kind(&self) -> PluginKind {
        PluginKind::OpenClash
    }

    fn display_name(&self) -> &'static str {
        "OpenClash"
    }

    fn restart_commands(&self) -> Vec<String> {
        vec!["/etc/init.d/openclash restart >/dev/null 2>&1 &".to_string()]
    }

    fn log_tail(&self) -> LogTail {
        LogTail::StartLog
    }

    fn is_success_marker(&self, line: &str) -> bool {
        // OpenClash only reports progress as localized step names
        line.contains("第九步") || line.contains("第八步") || line.contains("启动成功")
    }

    fn version_command(&self) -> String {
        "opkg status luci-app-openclash 2>/dev/null | awk -F ': ' '/Version/{print \"v\"$2}'"
            .to_string()
    }

    fn throttles_lines(&self) -> bool {
        false
    }

    fn service_log(&self, kind: ServiceLogKind) -> ServiceLogSource {
        ServiceLogSource {
            path: OPENCLASH_LOG.to_string(),
            kernel_lines: Some(kind == ServiceLogKind::Kernel),
        }
    }

    fn clear_log_command(&self, _kind: ServiceLogKind) -> String {
        format!("cat /dev/null > {}", OPENCLASH_LOG)
    }
}

/// Package a MihomoTProxy server actually runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MihomoPackage {
    Mihomo,
    Nikki,
}

impl MihomoPackage {
    pub fn name(&self) -> &'static str {
        match self {
            MihomoPackage::Mihomo => "mihomo",
            MihomoPackage::Nikki => "nikki",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MihomoDriver {
    package: MihomoPackage,
}

impl MihomoDriver {
    pub fn new(package: MihomoPackage) -> Self {
        Self { package }
    }

    pub fn package(&self) -> MihomoPackage {
        self.package
    }

    fn log_path(&self, file: &str) -> String {
        format!("/var/log/{}/{}", self.package.name(), file)
    }
}

impl PluginDriver for MihomoDriver {
    fn kind(&self) -> PluginKind {
        PluginKind::MihomoTProxy
    }

    fn display_name(&self) -> &'static str {
        match self.package {
            MihomoPackage::Mihomo => "MihomoTProxy",
            MihomoPackage::Nikki => "Nikki",
        }
    }

    fn restart_commands(&self) -> Vec<String> {
        let name = self.package.name();
        vec![
            format!("/usr/libexec/{}-call clear_log app", name),
            format!("/etc/init.d/{} restart", name),
        ]
    }

    fn log_tail(&self) -> LogTail {
        LogTail::Exec(format!("tail -n 1000 {}", self.log_path("app.log")))
    }

    fn is_success_marker(&self, line: &str) -> bool {
        line.to_ascii_lowercase().contains("start successful") || line.contains("启动成功")
    }

    fn version_command(&self) -> String {
        match self.package {
            MihomoPackage::Mihomo => "/usr/libexec/mihomo-call version app".to_string(),
            MihomoPackage::Nikki => {
                "opkg status luci-app-nikki 2>/dev/null | awk -F ': ' '/Version/{print \"v\"$2}'"
                    .to_string()
            }
        }
    }

    fn throttles_lines(&self) -> bool {
        true
    }

    fn service_log(&self, kind: ServiceLogKind) -> ServiceLogSource {
        let file = match kind {
            ServiceLogKind::Plugin => "app.log",
            ServiceLogKind::Kernel => "core.log",
        };
        ServiceLogSource {
            path: self.log_path(file),
            kernel_lines: None,
        }
    }

    fn clear_log_command(&self, kind: ServiceLogKind) -> String {
        let target = match kind {
            ServiceLogKind::Plugin => "app",
            ServiceLogKind::Kernel => "core",
        };
        format!("/usr/libexec/{}-call clear_log {}", self.package.name(), target)
    }
}

/// Pick the driver for a plugin kind, probing the router for Nikki
pub async fn resolve_driver(
    transport: &dyn Transport,
    endpoint: &ServerEndpoint,
    session: &AuthSession,
    kind: PluginKind,
) -> Result<Box<dyn PluginDriver>, TransportError> {
    match kind {
        PluginKind::OpenClash => Ok(Box::new(OpenClashDriver)),
        PluginKind::MihomoTProxy => {
            let package = if luci::is_nikki_installed(transport, endpoint, session).await? {
                MihomoPackage::Nikki
            } else {
                MihomoPackage::Mihomo
            };
            Ok(Box::new(MihomoDriver::new(package)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openclash_markers() {
        let driver = OpenClashDriver;
        assert!(driver.is_success_marker("2025-01-10 17:04:40 第九步: 重启 Dnsmasq 程序..."));
        assert!(driver.is_success_marker("OpenClash 启动成功，请等待服务器上线！"));
        assert!(!driver.is_success_marker("第七步: 设置防火墙规则..."));
        assert_eq!(driver.log_tail(), LogTail::StartLog);
    }

    #[test]
    fn test_mihomo_commands_follow_package() {
        let nikki = MihomoDriver::new(MihomoPackage::Nikki);
        assert_eq!(
            nikki.restart_commands(),
            vec![
                "/usr/libexec/nikki-call clear_log app".to_string(),
                "/etc/init.d/nikki restart".to_string(),
            ]
        );
        assert_eq!(
            nikki.log_tail(),
            LogTail::Exec("tail -n 1000 /var/log/nikki/app.log".to_string())
        );
        assert_eq!(nikki.display_name(), "Nikki");

        let mihomo = MihomoDriver::new(MihomoPackage::Mihomo);
        assert_eq!(mihomo.version_command(), "/usr/libexec/mihomo-call version app");
        assert_eq!(
            mihomo.clear_log_command(ServiceLogKind::Kernel),
            "/usr/libexec/mihomo-call clear_log core"
        );
        assert!(mihomo.is_success_marker("[2025-01-10 19:18:40] [App] Start Successful."));
    }

    #[test]
    fn test_plugin_kind_names() {
        assert_eq!(PluginKind::from_str("openclash"), Some(PluginKind::OpenClash));
        assert_eq!(PluginKind::from_str("nikki"), Some(PluginKind::MihomoTProxy));
        assert_eq!(PluginKind::from_str("passwall"), None);
        assert_eq!(
            serde_json::to_string(&PluginKind::MihomoTProxy).unwrap(),
            "\"mihomo_tproxy\""
        );
    }
}
