//! cordon-egress - egress enforcement proxy supervisor
//!
//! Launched by the VM lifecycle manager alongside a sandbox. Parses the
//! policy from the command line, starts the proxy listeners, and blocks
//! until SIGTERM/SIGINT, then drains in-flight connections and exits.

mod cli;

use clap::Parser;
use cli::Cli;
use cordon_proxy::{server, ProxyConfig, ProxyError};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight handlers get after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() {
    let cli = Cli::parse();

    // Initialize logging. Everything goes to stderr; stdout stays clean
    // for the parent process.
    let filter = if cli.no_log {
        EnvFilter::new("off")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("cordon-egress: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &ProxyError) -> i32 {
    match error {
        ProxyError::Config(_) | ProxyError::Policy(_) => 1,
        ProxyError::Bind { .. } => 2,
        _ => 3,
    }
}

fn run(cli: Cli) -> cordon_proxy::Result<()> {
    let config = ProxyConfig {
        bind_addr: cli.bind,
        http_port: cli.port,
        tls_port: cli.tls_port,
        dns_port: cli.dns_port,
        dns_upstream: cli.dns_upstream,
        default_action: cli.default_policy,
        rules: cli.rules,
        ..Default::default()
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let handle = server::start(config).await?;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }

        handle.shutdown();
        let remaining = handle.drain(SHUTDOWN_GRACE).await;
        if remaining > 0 {
            warn!(
                remaining,
                "grace period expired with handlers still running; exiting anyway"
            );
        }
        Ok(())
    })
}
