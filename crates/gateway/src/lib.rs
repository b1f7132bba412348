// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! mtgate: browser-facing terminal gateway.
//!
//! Accepts browser connections over HTTP/WebSocket, multiplexes every
//! terminal session onto one socket per browser, and drives per-session
//! `mthost` processes over local IPC so sessions survive gateway
//! restarts.

pub mod config;
pub mod discovery;
pub mod error;
pub mod hostclient;
pub mod manager;
pub mod mux;
pub mod mux_codec;
pub mod state;
pub mod transport;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::GatewayConfig;
use crate::manager::SessionManager;
use crate::mux::MuxManager;
use crate::state::GatewayState;
use crate::transport::build_router;

/// Run the gateway until shutdown.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handlers(&shutdown)?;

    let manager = SessionManager::new(config.service, shutdown.clone());
    if config.service {
        // Reconnect to hosts that survived a previous gateway.
        manager.discover_existing().await;
    }

    let mux = MuxManager::new();
    mux::spawn_fanout(Arc::clone(&mux), Arc::clone(&manager), shutdown.clone());

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr} failed (is the port already in use?)"))?;
    info!(
        addr = %addr,
        service_mode = config.service,
        "mtgate listening"
    );

    let state = Arc::new(GatewayState { config, manager, mux, shutdown: shutdown.clone() });
    let router = build_router(state);
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;
    Ok(())
}

/// SIGTERM and SIGINT stop the gateway; hosts keep their sessions alive.
fn spawn_signal_handlers(shutdown: &CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::terminate(), SignalKind::interrupt()] {
        let mut stream = signal(kind).context("installing signal handler failed")?;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            stream.recv().await;
            shutdown.cancel();
        });
    }
    Ok(())
}
