//! tls-vpn daemon binary.
//!
//! - no arguments: smart start — make sure a daemon is up (forking one when
//!   needed), then hand off to the presentation binary when installed
//! - `--service`: run as the daemon
//! - `--status`: summarize server/client/config over the control socket
//! - `--stop`: ask the daemon to shut down

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tlsvpn_core::control::{ControlClient, ControlServer, CONTROL_SOCKET_PATH};
use tlsvpn_core::logbus::{LogBus, LogBusLayer, DEFAULT_CAPACITY};
use tlsvpn_core::server::tls::install_crypto_provider;
use tlsvpn_core::service::{Service, ServicePaths};

/// Default daemon log file.
const LOG_FILE: &str = "/var/log/tls-vpn.log";

/// Name of the optional presentation binary launched by smart start.
const UI_BINARY: &str = "tls-vpn-ui";

#[derive(Parser, Debug)]
#[command(
    name = "tls-vpn",
    about = "Mutually-authenticated TLS 1.3 layer-3 VPN",
    after_help = "With no arguments the daemon is started if needed and the \
management UI is launched when installed.\n\
Control socket: /var/run/vpn_control.sock\n\
Log file: /var/log/tls-vpn.log"
)]
struct Cli {
    /// Run as the background daemon
    #[arg(long)]
    service: bool,

    /// Print daemon, server and client status
    #[arg(long)]
    status: bool,

    /// Stop the background daemon
    #[arg(long)]
    stop: bool,

    /// Bare `help` works like --help
    #[arg(value_name = "COMMAND")]
    command: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = if cli.command.as_deref() == Some("help") {
        let _ = Cli::command().print_help();
        Ok(())
    } else if let Some(other) = cli.command.as_deref() {
        eprintln!("unknown argument: {other} (try --help)");
        std::process::exit(2);
    } else if cli.service {
        run_service().await
    } else if cli.status {
        show_status().await
    } else if cli.stop {
        stop_service().await
    } else {
        smart_start().await
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// The daemon proper: log bus + tracing, service, control socket, signal
/// handling.
async fn run_service() -> Result<()> {
    install_crypto_provider();

    let probe = ControlClient::default();
    if probe.is_service_running().await {
        bail!(
            "a daemon is already answering on {}",
            CONTROL_SOCKET_PATH
        );
    }

    let logbus = Arc::new(attach_file_sink(LogBus::new(DEFAULT_CAPACITY)));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogBusLayer::new(Arc::clone(&logbus)))
        .init();

    info!(pid = std::process::id(), "tls-vpn service starting");

    let service = Arc::new(Service::new(ServicePaths::default())?);
    let control = ControlServer::new(
        CONTROL_SOCKET_PATH,
        Arc::clone(&service),
        Arc::clone(&logbus),
    );
    control.start().await?;

    println!("tls-vpn service started");
    println!("control socket: {CONTROL_SOCKET_PATH}");
    println!("log file: {LOG_FILE}");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping service");

    service.cleanup().await;
    control.stop();
    info!("tls-vpn service exited");
    Ok(())
}

fn attach_file_sink(bus: LogBus) -> LogBus {
    match bus.with_file_sink(&PathBuf::from(LOG_FILE)) {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("warning: cannot open {LOG_FILE} ({e}), file logging disabled");
            LogBus::new(DEFAULT_CAPACITY)
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Print a human summary of daemon, server, client and config state.
async fn show_status() -> Result<()> {
    let client = ControlClient::default();
    if !client.is_service_running().await {
        println!("service: not running");
        println!();
        println!("start it with: tls-vpn --service");
        return Ok(());
    }

    println!("service: running");
    println!();

    if let Ok(status) = client.server_status().await {
        if status.running {
            println!(
                "vpn server: running (port {}, clients {})",
                status.port, status.client_count
            );
            println!("  tun device: {}", status.tun_device);
            println!("  network: {}", status.network);
            println!(
                "  traffic: up {} / down {} bytes",
                status.total_sent, status.total_recv
            );
        } else {
            println!("vpn server: stopped");
        }
    }

    if let Ok(status) = client.client_status().await {
        if status.connected {
            println!("vpn client: connected (ip {})", status.assigned_ip);
            println!(
                "  server: {}:{}",
                status.server_address, status.server_port
            );
        } else {
            println!("vpn client: disconnected");
        }
    }

    if let Ok(config) = client.config_get().await {
        println!();
        println!("configuration:");
        let rendered = serde_json::to_string_pretty(&config.config)?;
        for line in rendered.lines() {
            println!("  {line}");
        }
    }
    Ok(())
}

async fn stop_service() -> Result<()> {
    let client = ControlClient::default();
    if !client.is_service_running().await {
        println!("service is not running");
        return Ok(());
    }

    println!("stopping service...");
    client.shutdown().await.context("shutdown request failed")?;
    println!("service stopped");
    Ok(())
}

/// Ensure the daemon exists (forking one when needed), then hand off to the
/// presentation binary when one is installed.
async fn smart_start() -> Result<()> {
    let client = ControlClient::default();

    if !client.is_service_running().await {
        println!("starting background service...");
        spawn_daemon()?;

        let mut up = false;
        for _ in 0..25 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if client.is_service_running().await {
                up = true;
                break;
            }
        }
        if !up {
            bail!(
                "the daemon did not come up; check {LOG_FILE} or run tls-vpn --service in the foreground"
            );
        }
        println!("service is up");
    }

    if let Some(ui) = find_ui_binary() {
        let status = std::process::Command::new(&ui)
            .status()
            .with_context(|| format!("launching {}", ui.display()))?;
        if !status.success() {
            warn!(ui = %ui.display(), code = ?status.code(), "presentation process exited abnormally");
        }
        return Ok(());
    }

    println!();
    println!("no management UI found ({UI_BINARY}); the daemon keeps running.");
    println!("inspect it with: tls-vpn --status");
    Ok(())
}

/// Fork a detached `tls-vpn --service`.
fn spawn_daemon() -> Result<()> {
    let exe = std::env::current_exe().context("locating own executable")?;
    std::process::Command::new(exe)
        .arg("--service")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("spawning daemon process")?;
    Ok(())
}

/// The presentation binary, next to this executable or on PATH.
fn find_ui_binary() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(UI_BINARY);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(UI_BINARY))
        .find(|candidate| candidate.exists())
}
