use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use clash_dash::clash::{ClashClient, ClashMode, ServerType};
use clash_dash::config::AppConfig;
use clash_dash::credentials::{CredentialStore, MemoryCredentialStore};
use clash_dash::logs::{LogLevel, LogStreamClient, LogStreamEvent, LogStreamStatus};
use clash_dash::monitor::{
    ConnectionFilter, ConnectionMonitor, MonitorView, SortKey, StateFilter,
};
use clash_dash::plugin::ServiceLogKind;
use clash_dash::restart::{
    LuciRestartTarget, RestartEvent, RestartOrchestrator, RestartPhase, RestartSession,
};
use clash_dash::service_log;
use clash_dash::transport::{HttpTransport, ServerEndpoint, Transport};

#[derive(Parser)]
#[command(name = "clash-dash")]
#[command(version)]
#[command(about = "Monitor and control Clash/Mihomo cores on your router", long_about = None)]
struct Cli {
    /// Saved server id or name
    #[arg(long, short)]
    server: Option<String>,

    /// Clash External Controller API URL (overrides --server)
    #[arg(long)]
    api_url: Option<String>,

    /// Clash External Controller secret
    #[arg(long)]
    secret: Option<String>,

    /// Router password for LuCI servers (not saved)
    #[arg(long, env = "CLASH_DASH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Config file (default: <config dir>/clash-dash/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Test the connection and print server status
    Test,
    /// Watch live connections
    Connections {
        /// Number of snapshots to print
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// tcp or udp
        #[arg(long)]
        network: Option<String>,
        /// Only active (or only closed) connections
        #[arg(long, value_parser = ["all", "active", "closed"], default_value = "all")]
        state: String,
        /// Text filter over host, IP, chain and rule
        #[arg(long)]
        query: Option<String>,
        /// start, host, upload, download, upload-speed, download-speed
        #[arg(long, default_value = "download-speed")]
        sort: String,
        #[arg(long)]
        ascending: bool,
    },
    /// Stream the kernel log
    Logs {
        #[arg(long)]
        level: Option<String>,
    },
    /// Show or switch the proxy mode
    Mode { mode: Option<String> },
    /// Restart the proxy service on the router
    Restart,
    /// Print core or plugin version
    Version,
    /// Print or clear the plugin or kernel log on the router
    ServiceLog {
        #[arg(long)]
        kernel: bool,
        #[arg(long)]
        clear: bool,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_env("CLASH_DASH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match std::env::var("CLASH_DASH_DEBUG_LOG") {
        Ok(path) if !path.trim().is_empty() => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open debug log {}", path))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        _ => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    // Load or create config
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path()?,
    };
    // A missing file yields defaults; a broken one is reported, never overwritten
    let config = AppConfig::load_with_cli(&config_path, cli.api_url.clone(), cli.secret.clone())?;

    let profile = config
        .server(cli.server.as_deref())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No server configured, pass --api-url or add one to {}", config_path.display()))?;

    let store = MemoryCredentialStore::new();
    if let (Some(password), clash_dash::config::ServerKind::Luci { username, .. }) =
        (&cli.password, &profile.kind)
    {
        store.save(&profile.id, username, password)?;
    }
    let endpoint = profile.endpoint(&store)?;

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.trust_policy())?);

    match cli.command {
        Command::Test => test_api_connection(transport, endpoint).await,
        Command::Connections {
            count,
            network,
            state,
            query,
            sort,
            ascending,
        } => {
            let filter = ConnectionFilter {
                network,
                state: match state.as_str() {
                    "active" => StateFilter::Active,
                    "closed" => StateFilter::Closed,
                    _ => StateFilter::All,
                },
                query,
                sort: SortKey::from_str(&sort)
                    .ok_or_else(|| anyhow::anyhow!("Unknown sort key '{}'", sort))?,
                descending: !ascending,
            };
            let endpoint = stream_endpoint(transport.clone(), endpoint).await?;
            watch_connections(transport, endpoint, &config, filter, count).await
        }
        Command::Logs { level } => {
            let level = match level {
                Some(level) => LogLevel::from_str(&level)
                    .ok_or_else(|| anyhow::anyhow!("Unknown log level '{}'", level))?,
                None => config.logs.level,
            };
            let endpoint = stream_endpoint(transport.clone(), endpoint).await?;
            stream_logs(transport, endpoint, &config, level).await
        }
        Command::Mode { mode } => {
            let client = connect(transport, endpoint).await?;
            match mode {
                Some(mode) => {
                    let mode = ClashMode::from_str(&mode)
                        .ok_or_else(|| anyhow::anyhow!("Unknown mode '{}'", mode))?;
                    client.set_mode(mode).await?;
                    println!("✓ Mode set to {}", mode.as_str());
                }
                None => println!("{}", client.get_mode().await?.as_str()),
            }
            Ok(())
        }
        Command::Restart => restart_service(transport, endpoint, &config).await,
        Command::Version => {
            let client = connect(transport, endpoint).await?;
            if client.endpoint().is_luci() {
                println!("{}", client.get_plugin_version().await?.display_version());
            } else {
                let version = client.get_version().await?;
                let flavor = match version.server_type() {
                    ServerType::Premium => " (premium)",
                    ServerType::Meta => " (meta)",
                    ServerType::Unknown => "",
                };
                println!("{}{}", version.version, flavor);
            }
            Ok(())
        }
        Command::ServiceLog { kernel, clear } => {
            let client = connect(transport, endpoint).await?;
            let kind = if kernel {
                ServiceLogKind::Kernel
            } else {
                ServiceLogKind::Plugin
            };
            if clear {
                service_log::clear_service_log(&client, kind).await?;
                println!("✓ Log cleared");
            } else {
                for entry in service_log::fetch_service_log(&client, kind).await? {
                    println!(
                        "{} [{:?}] {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.level,
                        entry.message
                    );
                }
            }
            Ok(())
        }
    }
}

/// Streams only run against a controller; look it up behind a router login
async fn stream_endpoint(
    transport: Arc<dyn Transport>,
    endpoint: ServerEndpoint,
) -> Result<ServerEndpoint> {
    if !endpoint.is_luci() {
        return Ok(endpoint);
    }
    let client = connect(transport, endpoint).await?;
    client
        .controller_endpoint()
        .await
        .context("Failed to find the controller behind the router")
}

async fn connect(transport: Arc<dyn Transport>, endpoint: ServerEndpoint) -> Result<ClashClient> {
    ClashClient::connect(transport, endpoint)
        .await
        .context("Authentication failed")
}

async fn test_api_connection(transport: Arc<dyn Transport>, endpoint: ServerEndpoint) -> Result<()> {
    println!("Testing connection to {}...", endpoint.base_url());

    let client = match connect(transport, endpoint).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("✗ Connection failed: {:#}", e);
            std::process::exit(1);
        }
    };

    if client.endpoint().is_luci() {
        match client.get_plugin_version().await {
            Ok(version) => println!("✓ Connected to {}", version.display_version()),
            Err(e) => {
                eprintln!("✗ Connection failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    // Test connection
    match client.get_version().await {
        Ok(version) => println!("✓ Connected successfully! Core {}", version.version),
        Err(e) => {
            eprintln!("✗ Connection failed: {}", e);
            std::process::exit(1);
        }
    }

    // Get config
    println!("\nFetching configuration...");
    match client.get_config().await {
        Ok(config) => {
            println!("✓ Configuration:");
            println!("  Mode: {}", config.mode);
            println!("  HTTP Port: {}", config.port);
            println!("  SOCKS Port: {}", config.socks_port);
            println!("  Allow LAN: {}", config.allow_lan);
        }
        Err(e) => {
            eprintln!("✗ Failed to get config: {}", e);
        }
    }

    // Get proxies
    println!("\nFetching proxy groups...");
    match client.get_proxies().await {
        Ok(proxies) => {
            let mut groups: Vec<_> = proxies
                .proxies
                .iter()
                .filter(|(_, proxy)| proxy.is_group())
                .collect();
            groups.sort_by_key(|(name, _)| *name);
            println!("✓ Found {} proxy groups:", groups.len());

            for (name, proxy) in groups.iter().take(10) {
                println!("  - {} ({})", name, proxy.proxy_type);
                if let Some(now) = &proxy.now {
                    println!("    Current: {}", now);
                }
            }

            if groups.len() > 10 {
                println!("  ... and {} more", groups.len() - 10);
            }
        }
        Err(e) => {
            eprintln!("✗ Failed to get proxies: {}", e);
        }
    }

    println!("\n✓ All tests completed successfully!");

    Ok(())
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn print_view(view: &MonitorView) {
    let agg = &view.aggregate;
    println!(
        "\n↑ {}/s  ↓ {}/s  total ↑ {} ↓ {}  active {}  closed {}{}",
        format_bytes(agg.upload_speed),
        format_bytes(agg.download_speed),
        format_bytes(agg.upload_total as f64),
        format_bytes(agg.download_total as f64),
        agg.active_count,
        agg.closed_count,
        agg.memory
            .map(|m| format!("  mem {}", format_bytes(m as f64)))
            .unwrap_or_default()
    );
    for record in view.connections.iter().take(20) {
        println!(
            "  {} {:<4} {:<40} ↑ {:>10}/s ↓ {:>10}/s  {}",
            if record.is_alive { "●" } else { "○" },
            record.metadata.network,
            record.destination(),
            format_bytes(record.upload_speed),
            format_bytes(record.download_speed),
            record.chain_display()
        );
    }
}

async fn watch_connections(
    transport: Arc<dyn Transport>,
    endpoint: ServerEndpoint,
    config: &AppConfig,
    filter: ConnectionFilter,
    count: usize,
) -> Result<()> {
    let mut monitor = ConnectionMonitor::new(transport, config.monitor_options());
    monitor.set_filter(filter);
    let mut views = monitor.subscribe();
    monitor.start(endpoint).await;

    let mut printed = 0;
    while printed < count {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let view = views.borrow_and_update().clone();
        match &view.status {
            clash_dash::monitor::MonitorStatus::Failed(reason) => {
                monitor.stop().await;
                anyhow::bail!("Monitor failed: {}", reason);
            }
            clash_dash::monitor::MonitorStatus::Reconnecting { attempt, reason } => {
                eprintln!("… reconnecting (attempt {}): {}", attempt, reason);
            }
            clash_dash::monitor::MonitorStatus::Connected => {
                print_view(&view);
                printed += 1;
            }
            _ => {}
        }
    }

    monitor.stop().await;
    Ok(())
}

async fn stream_logs(
    transport: Arc<dyn Transport>,
    endpoint: ServerEndpoint,
    config: &AppConfig,
    level: LogLevel,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = LogStreamClient::new(transport, config.logs.buffer_capacity, tx);
    client.connect(endpoint, level).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(LogStreamEvent::Entry(entry)) => {
                    println!("{} [{}] {}", entry.timestamp, entry.level, entry.message);
                }
                Some(LogStreamEvent::Status(LogStreamStatus::Connected)) => {
                    eprintln!("✓ Log stream connected ({})", level.as_str());
                }
                Some(LogStreamEvent::Status(LogStreamStatus::Reconnecting { attempt, delay })) => {
                    eprintln!("… reconnecting in {}s (attempt {})", delay.as_secs(), attempt);
                }
                Some(LogStreamEvent::Status(LogStreamStatus::Disconnected(reason))) => {
                    client.disconnect().await;
                    anyhow::bail!("Log stream disconnected: {}", reason);
                }
                None => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn restart_service(
    transport: Arc<dyn Transport>,
    endpoint: ServerEndpoint,
    config: &AppConfig,
) -> Result<()> {
    let client = connect(transport, endpoint).await?;
    let target = LuciRestartTarget::for_client(&client).await?;
    println!("Restarting {}...", target.driver().display_name());

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let orchestrator = RestartOrchestrator::new(config.restart_timing(), events_tx);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut session = RestartSession::new(target.driver().kind());

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                RestartEvent::Line(line) => println!("  {}", line),
                RestartEvent::Phase(phase) => tracing::debug!(?phase, "restart phase"),
            }
        }
    });

    let phase = tokio::select! {
        phase = orchestrator.run(&mut session, &target, cancel_rx) => phase,
        _ = tokio::signal::ctrl_c() => RestartPhase::Failed("restart cancelled".to_string()),
    };
    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    match phase {
        RestartPhase::Succeeded => {
            println!("✓ Service restarted");
            Ok(())
        }
        RestartPhase::TimedOut => anyhow::bail!("Restart log timed out, check the service status"),
        RestartPhase::Failed(reason) => anyhow::bail!("Restart failed: {}", reason),
        other => anyhow::bail!("Restart ended in unexpected phase {:?}", other),
    }
}
