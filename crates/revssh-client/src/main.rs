//! revssh-reverse: reverse client for a revssh broker.
//!
//! Connects out to the broker, registers this machine's hostname and serves
//! SSH sessions tunnelled back through the broker.

use anyhow::{Context, Result};
use clap::Parser;
use revssh_client::config::{AgentConfig, CliOverrides};
use revssh_client::{AgentSettings, ReverseAgent};
use revssh_core::{keys, FileAuthority};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long a signalled shutdown waits for the broker disconnect.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// revssh-reverse: reverse SSH client
#[derive(Parser, Debug)]
#[command(name = "revssh-reverse", version, about = "Reverse SSH client")]
struct Cli {
    /// Broker address (host:port)
    #[arg(short, long)]
    remote: Option<String>,

    /// Username to register as
    #[arg(short, long)]
    user: Option<String>,

    /// Hostname to register as (default: system hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// Directory with identity keys, authorized_keys and known_hosts
    #[arg(short, long)]
    path: Option<String>,

    /// Config file path (default: `<path>/reverse.toml`)
    #[arg(long)]
    config: Option<String>,

    /// Generate an Ed25519 identity key in the key directory if none exists
    #[arg(long)]
    generate_key: bool,

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
        None => {
            PathBuf::from(cli.path.as_deref().unwrap_or("~/.config/revssh")).join("reverse.toml")
        }
    };
    let overrides = CliOverrides {
        remote: cli.remote.clone(),
        user: cli.user.clone(),
        hostname: cli.hostname.clone(),
        path: cli.path.clone(),
    };
    let config = match AgentConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        remote = %config.remote,
        user = %config.user,
        hostname = %config.hostname,
        path = %config.path.display(),
        "starting revssh-reverse"
    );

    let agent = match build_agent(&config, cli.generate_key) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to create agent");
            std::process::exit(1);
        }
    };

    let run = agent.run();
    tokio::pin!(run);
    let signalled = tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                error!(error = %e, "reverse client stopped");
                std::process::exit(1);
            }
            false
        }
        _ = shutdown_signal() => true,
    };

    if signalled {
        info!("received shutdown signal");
        agent.shutdown();
        match tokio::time::timeout(SHUTDOWN_GRACE, run).await {
            Ok(Err(e)) => warn!(error = %e, "reverse client stopped with error"),
            Ok(Ok(())) => {}
            Err(_) => warn!("broker disconnect timed out"),
        }
    }

    info!("revssh-reverse stopped");
}

fn build_agent(config: &AgentConfig, generate_key: bool) -> Result<ReverseAgent> {
    if generate_key {
        let path = keys::generate_host_key(&config.path)
            .with_context(|| format!("cannot generate key in {}", config.path.display()))?;
        info!(path = %path.display(), "identity key ready");
    }

    let settings = AgentSettings::new(&config.remote, &config.user, &config.hostname);
    let authority = Arc::new(FileAuthority::new(&config.path));
    Ok(ReverseAgent::new(settings, authority))
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
