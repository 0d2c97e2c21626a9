//! simproxy - relay between simulated agents and a Simspark server
//!
//! Accepts agent connections, opens one upstream connection per agent and
//! keeps the server's sync mode moving when agents fall behind.

mod cli;
mod console;

use anyhow::{Context, Result};
use clap::Parser;
use simproxy_server::RelayServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{build_settings, Args};

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!(
        "simproxy {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let settings = build_settings(&args).context("Failed to build proxy configuration")?;

    info!("Proxy port: {}", settings.relay.bind_addr.port());
    info!(
        "Simulation server: {}:{}",
        settings.relay.upstream_host, settings.relay.upstream_port
    );
    if let Some(max_agents) = settings.relay.max_agents {
        info!("Agent limit: {}", max_agents);
    }

    let server = Arc::new(
        RelayServer::bind(settings.relay)
            .await
            .context("Failed to start proxy server")?,
    );

    let mut relay_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            None
        }
        _ = console::run(server.clone()), if !settings.daemon => {
            info!("Quit requested, shutting down...");
            None
        }
        result = &mut relay_task => Some(result),
    };

    server.shutdown().await;

    let result = match finished {
        Some(result) => result,
        None => relay_task.await,
    };

    match result {
        Ok(Ok(())) => {
            info!("Proxy stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Proxy error: {:#}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Proxy task panicked: {}", e);
            Err(e.into())
        }
    }
}
