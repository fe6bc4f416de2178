//! tetherd — device-side remote-control agent.
//!
//! Keeps one outbound connection to a controller alive with loss-tolerant
//! reconnection, serves the same command surface on local channels, and
//! runs a serialized package-install pipeline. Device specifics (UI tree,
//! gestures, streaming media, install finalization) live behind the
//! collaborator traits in `services`, fulfilled here by the command-driven
//! adapters in `platform`.

mod config;
mod dispatcher;
mod handlers;
mod http;
mod install;
mod local;
mod platform;
mod reverse;
mod services;
#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::dispatcher::Dispatcher;
use crate::handlers::Handlers;
use crate::install::InstallPipeline;
use crate::local::LocalServer;
use crate::platform::bridge::CommandBridge;
use crate::platform::installer::StagedInstaller;
use crate::reverse::{ReverseConfig, ReverseLink};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "tetherd", version)]
#[command(about = "Device-side remote-control agent")]
struct Cli {
    /// Path to the agent configuration (tetherd.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Controller WebSocket URL template (may contain {deviceId})
    #[arg(long)]
    controller_url: Option<String>,

    /// Bearer token presented to the controller
    #[arg(long)]
    token: Option<String>,

    /// Device identifier (generated when omitted)
    #[arg(long)]
    device_id: Option<String>,

    /// Local line-JSON listen port
    #[arg(long)]
    local_port: Option<u16>,

    /// HTTP listen address, e.g. 127.0.0.1:8723
    #[arg(long)]
    http_listen: Option<String>,

    /// Automation bridge binary invoked per device operation
    #[arg(long)]
    bridge: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("TETHERD_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(url) = cli.controller_url {
        cfg.controller.url = url;
    }
    if let Some(token) = cli.token {
        cfg.controller.token = token;
    }
    if let Some(id) = cli.device_id {
        cfg.device.id = id;
    }
    if let Some(port) = cli.local_port {
        cfg.channels.local_port = port;
    }
    if let Some(listen) = cli.http_listen {
        cfg.channels.http_listen = Some(listen);
    }
    if let Some(bridge) = cli.bridge {
        cfg.bridge.binary = bridge;
    }

    if cfg.device.id.trim().is_empty() {
        cfg.device.id = uuid::Uuid::new_v4().to_string();
        info!(device_id = %cfg.device.id, "generated device identifier");
    }

    let bridge = CommandBridge::new(&cfg.bridge);
    let installer =
        Arc::new(StagedInstaller::new(&cfg.install).context("install spool unavailable")?);
    let pipeline = Arc::new(
        InstallPipeline::new(installer, bridge.clone()).context("install pipeline unavailable")?,
    );

    let (port_tx, port_rx) = watch::channel(cfg.channels.local_port);
    let handlers = Arc::new(Handlers::new(
        bridge.clone(),
        bridge.clone(),
        bridge.clone(),
        bridge.clone(),
        bridge.clone(),
        pipeline,
        AGENT_VERSION,
        port_tx,
    ));
    let dispatcher = Dispatcher::new(handlers);

    let local = LocalServer::new(
        Arc::clone(&dispatcher),
        cfg.channels.local_host.clone(),
        port_rx,
    );
    tokio::spawn(local.run());

    if let Some(listen) = cfg.channels.http_listen.clone() {
        let router = http::router(Arc::clone(&dispatcher));
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind HTTP channel on {listen}"))?;
        info!(addr = %listen, "http channel listening");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                warn!(error = %err, "http channel terminated");
            }
        });
    }

    let link = ReverseLink::new(
        ReverseConfig {
            url_template: cfg.controller.url.clone(),
            token: cfg.controller.token.clone(),
            user_id: cfg.controller.user_id.clone(),
            service_key: cfg.controller.service_key.clone(),
            device_id: cfg.device.id.clone(),
            device_name: cfg.device.name.clone(),
            device_locale: cfg.device.locale.clone(),
        },
        Arc::clone(&dispatcher),
        bridge.clone(),
        bridge.clone(),
    );
    let supervisor = link.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    link.disconnect();
    let _ = supervisor.await;
    Ok(())
}
