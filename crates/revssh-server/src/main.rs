//! revssh-server: SSH bastion for reverse clients.
//!
//! Accepts SSH connections, lets reverse clients register a hostname, and
//! forwards inbound `direct-tcpip` requests either directly or through the
//! registered reverse client.

use anyhow::{Context, Result};
use clap::Parser;
use revssh_core::{keys, FileAuthority, Role, TcpDialer};
use revssh_server::config::ServerConfig;
use revssh_server::{ConnectionManager, ConnectionSettings, ReverseClientRegistry, RevsshServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// revssh-server: reverse SSH bastion
#[derive(Parser, Debug)]
#[command(name = "revssh-server", version, about = "Reverse SSH bastion")]
struct Cli {
    /// Listen address (`:22` binds every interface)
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory with host keys, authorized_keys and known_hosts
    #[arg(short, long)]
    path: Option<String>,

    /// Config file path (default: `<path>/server.toml`)
    #[arg(long)]
    config: Option<String>,

    /// Maximum authentication attempts per connection (0 = unlimited)
    #[arg(long)]
    max_auth_tries: Option<usize>,

    /// Generate an Ed25519 host key in the key directory if none exists
    #[arg(long)]
    generate_host_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = match &cli.config {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(cli.path.as_deref().unwrap_or("~/.config/revssh")).join("server.toml"),
    };
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.path.as_deref(),
        cli.max_auth_tries,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %server_config.listen,
        path = %server_config.path.display(),
        "starting revssh-server"
    );

    let server = match build_server(&server_config, cli.generate_host_key) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run(&server_config.listen) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("revssh-server stopped");
}

fn build_server(config: &ServerConfig, generate_host_key: bool) -> Result<RevsshServer> {
    if generate_host_key {
        let path = keys::generate_host_key(&config.path)
            .with_context(|| format!("cannot generate host key in {}", config.path.display()))?;
        info!(path = %path.display(), "host key ready");
    }

    let authority = Arc::new(FileAuthority::new(&config.path));
    let settings = ConnectionSettings::new(Role::Broker).with_max_auth_tries(config.max_auth_tries);
    let manager = ConnectionManager::new(
        settings,
        authority,
        Arc::new(ReverseClientRegistry::new()),
        Arc::new(TcpDialer),
    )
    .with_context(|| {
        format!(
            "no usable host key in {} (try --generate-host-key)",
            config.path.display()
        )
    })?;

    Ok(RevsshServer::new(manager))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
