// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multiplexed terminal WebSocket.
//!
//! One socket carries every session's traffic. Attach sends the Init
//! greeting and a scrollback snapshot per live session before any live
//! frame; afterwards the per-client pump drains the output queue while
//! the receive loop routes input and performs resyncs.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::mux::{MuxClient, RECEIVE_TIMEOUT};
use crate::mux_codec::{
    init_frame, output_frames, parse_resize_payload, try_parse_frame, MuxFrameType,
};
use crate::state::GatewayState;

type WsSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

/// `GET /ws/mux`: WebSocket upgrade for the multiplexed stream.
pub async fn ws_mux_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_mux_connection(state, socket))
}

async fn handle_mux_connection(state: Arc<GatewayState>, socket: WebSocket) {
    let (ws_tx, mut ws_rx) = socket.split();
    let sink: WsSink = Arc::new(tokio::sync::Mutex::new(ws_tx));
    let client = MuxClient::new();
    info!(client = %client.id, "mux client attached");

    // Greeting and per-session snapshots go out before the client is
    // registered for live fanout, so the snapshot is always first.
    if attach(&state, &sink, &client.id).await.is_err() {
        return;
    }

    state.mux.register(Arc::clone(&client)).await;
    let pump = tokio::spawn(output_pump(Arc::clone(&client), Arc::clone(&sink)));

    loop {
        match tokio::time::timeout(RECEIVE_TIMEOUT, ws_rx.next()).await {
            // Timeout: fall through to the periodic resync check.
            Err(_) => {}
            Ok(Some(Ok(Message::Binary(data)))) => handle_frame(&state, &data).await,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {} // text/ping/pong: nothing to route
            Ok(Some(Err(e))) => {
                debug!(client = %client.id, err = %e, "mux receive failed");
                break;
            }
        }

        client.evaluate_backpressure();
        if client.needs_resync() {
            if let Err(e) = resync(&state, &client, &sink).await {
                debug!(client = %client.id, err = format!("{e:#}"), "resync failed");
                break;
            }
        }
    }

    state.mux.remove(&client.id).await;
    pump.abort();
    info!(client = %client.id, "mux client detached");
}

/// Send the Init frame and one snapshot Output frame per live session.
async fn attach(state: &Arc<GatewayState>, sink: &WsSink, client_id: &str) -> anyhow::Result<()> {
    let mut tx = sink.lock().await;
    tx.send(Message::Binary(init_frame(client_id)?)).await?;

    for info in state.manager.list().await {
        match state.manager.buffer(&info.id).await {
            Ok(buffer) => {
                for frame in output_frames(&info.id, info.cols, info.rows, &buffer)? {
                    tx.send(Message::Binary(frame)).await?;
                }
            }
            Err(e) => {
                debug!(session = %info.id, err = format!("{e:#}"), "snapshot unavailable");
            }
        }
    }
    Ok(())
}

/// Drain the client's queue onto the socket, in order.
async fn output_pump(client: Arc<MuxClient>, sink: WsSink) {
    loop {
        client.wait_output().await;
        while let Some((frame, epoch)) = client.pop_primary() {
            let mut tx = sink.lock().await;
            // A resync may have started while we waited for the sink; its
            // snapshot supersedes this frame.
            if client.epoch() != epoch {
                continue;
            }
            if tx.send(Message::Binary(frame)).await.is_err() {
                return;
            }
        }
    }
}

/// Full resync: discard the stale queue, send an authoritative snapshot
/// of every session, then flush frames that arrived meanwhile.
async fn resync(
    state: &Arc<GatewayState>,
    client: &Arc<MuxClient>,
    sink: &WsSink,
) -> anyhow::Result<()> {
    let discarded = client.begin_resync();
    debug!(client = %client.id, discarded, "resync started");

    let mut tx = sink.lock().await;
    for info in state.manager.list().await {
        match state.manager.buffer(&info.id).await {
            Ok(buffer) => {
                for frame in output_frames(&info.id, info.cols, info.rows, &buffer)? {
                    tx.send(Message::Binary(frame)).await?;
                }
            }
            Err(e) => {
                debug!(session = %info.id, err = format!("{e:#}"), "snapshot unavailable");
            }
        }
    }

    // Post-snapshot frames must be applied in order; take_pending clears
    // the resync flags once the queue is empty.
    while let Some(batch) = client.take_pending() {
        for frame in batch {
            tx.send(Message::Binary(frame)).await?;
        }
    }

    debug!(client = %client.id, "resync complete");
    Ok(())
}

/// Route one inbound frame. Only Input and Resize are accepted.
async fn handle_frame(state: &Arc<GatewayState>, data: &[u8]) {
    let frame = match try_parse_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(err = %e, "ignoring malformed mux frame");
            return;
        }
    };

    match frame.kind {
        MuxFrameType::Input => {
            if frame.payload.len() < 20 {
                debug!(session = %frame.session_id, input = ?frame.payload, "mux input");
            }
            if let Err(e) = state.manager.send_input(frame.session_id, frame.payload).await {
                debug!(session = %frame.session_id, err = format!("{e:#}"), "input routing failed");
            }
        }
        MuxFrameType::Resize => match parse_resize_payload(frame.payload) {
            Ok((cols, rows)) => {
                if let Err(e) = state.manager.resize(frame.session_id, cols, rows).await {
                    warn!(
                        session = %frame.session_id,
                        cols,
                        rows,
                        err = format!("{e:#}"),
                        "resize failed"
                    );
                }
            }
            Err(e) => debug!(err = %e, "bad resize payload"),
        },
        // Output and Init are server-to-browser only.
        MuxFrameType::Output | MuxFrameType::Init => {
            debug!(kind = ?frame.kind, "ignoring server-only frame from browser");
        }
    }
}
