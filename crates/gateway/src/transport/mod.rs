// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the gateway.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::GatewayState;

/// Build the axum `Router` with all gateway routes.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        // Health (no session required)
        .route("/api/health", get(http::health))
        // Session management
        .route("/api/sessions", get(http::list_sessions).post(http::create_session))
        .route("/api/sessions/{id}", axum::routing::delete(http::close_session))
        .route("/api/sessions/{id}/resize", post(http::resize_session))
        .route("/api/sessions/{id}/name", post(http::name_session))
        .route("/api/sessions/{id}/order", post(http::order_session))
        .route("/api/sessions/{id}/loglevel", post(http::session_log_level))
        .route("/api/sessions/{id}/upload", post(http::session_upload))
        .route("/api/sessions/{id}/buffer", get(http::session_buffer))
        // Multiplexed terminal stream
        .route("/ws/mux", get(ws::ws_mux_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
