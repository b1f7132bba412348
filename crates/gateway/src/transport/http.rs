// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the gateway API.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use mthost::session_info::{SessionInfo, ShellType};
use mthost::supervisor::{MAX_DIM, MIN_DIM};

use crate::error::GatewayError;
use crate::state::GatewayState;

fn dims_valid(cols: u16, rows: u16) -> bool {
    (MIN_DIM..=MAX_DIM).contains(&cols) && (MIN_DIM..=MAX_DIM).contains(&rows)
}

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub session_count: usize,
    pub mux_clients: usize,
    pub service_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    #[serde(default)]
    pub name: Option<String>,
    /// Manual renames pin the name against shell-title updates.
    #[serde(default = "default_manual")]
    pub manual: bool,
}

fn default_manual() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub order: u8,
}

#[derive(Debug, Serialize)]
pub struct ClosedResponse {
    pub id: String,
    pub closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogLevelRequest {
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub path: String,
    pub bytes: usize,
}

// -- Handlers -----------------------------------------------------------------

pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        session_count: state.manager.list().await.len(),
        mux_clients: state.mux.client_count().await,
        service_mode: state.config.service,
    })
}

pub async fn list_sessions(State(state): State<Arc<GatewayState>>) -> Json<Vec<SessionInfo>> {
    Json(state.manager.list().await)
}

pub async fn create_session(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreateRequest>,
) -> impl IntoResponse {
    let shell = match &req.shell {
        Some(name) => match ShellType::from_name(name) {
            Some(shell) => shell,
            None => {
                return GatewayError::BadRequest
                    .to_http_response(format!("unknown shell type: {name}"))
                    .into_response();
            }
        },
        None => ShellType::default(),
    };

    if !dims_valid(req.cols, req.rows) {
        return GatewayError::BadRequest
            .to_http_response(format!("cols/rows must be in {MIN_DIM}..{MAX_DIM}"))
            .into_response();
    }

    match state.manager.create(shell, req.cwd, req.cols, req.rows).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => GatewayError::Internal.to_http_response(format!("{e:#}")).into_response(),
    }
}

pub async fn close_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.close(&id).await {
        Ok(()) => Json(ClosedResponse { id, closed: true }).into_response(),
        Err(e) => GatewayError::SessionNotFound.to_http_response(format!("{e:#}")).into_response(),
    }
}

pub async fn resize_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> impl IntoResponse {
    if !dims_valid(req.cols, req.rows) {
        return GatewayError::BadRequest
            .to_http_response(format!("cols/rows must be in {MIN_DIM}..{MAX_DIM}"))
            .into_response();
    }
    if state.manager.info(&id).await.is_none() {
        return GatewayError::SessionNotFound
            .to_http_response(format!("unknown session {id}"))
            .into_response();
    }
    match state.manager.resize(&id, req.cols, req.rows).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => GatewayError::HostUnreachable.to_http_response(format!("{e:#}")).into_response(),
    }
}

pub async fn name_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<NameRequest>,
) -> impl IntoResponse {
    match state.manager.set_name(&id, req.name.as_deref(), req.manual).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => GatewayError::SessionNotFound.to_http_response(format!("{e:#}")).into_response(),
    }
}

pub async fn order_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<OrderRequest>,
) -> impl IntoResponse {
    match state.manager.set_order(&id, req.order).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => GatewayError::SessionNotFound.to_http_response(format!("{e:#}")).into_response(),
    }
}

pub async fn session_log_level(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<LogLevelRequest>,
) -> impl IntoResponse {
    if state.manager.info(&id).await.is_none() {
        return GatewayError::SessionNotFound
            .to_http_response(format!("unknown session {id}"))
            .into_response();
    }
    match state.manager.set_log_level(&id, &req.level).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => GatewayError::BadRequest.to_http_response(format!("{e:#}")).into_response(),
    }
}

/// Drag-and-drop upload into the session's scratch directory. The browser
/// then pastes the returned path into the terminal.
pub async fn session_upload(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // The file lands inside the drop dir or nowhere.
    if query.name.is_empty()
        || query.name.contains(['/', '\\'])
        || query.name.starts_with('.')
    {
        return GatewayError::BadRequest
            .to_http_response(format!("invalid upload name {:?}", query.name))
            .into_response();
    }

    let dir = match state.manager.drop_dir(&id).await {
        Ok(dir) => dir,
        Err(e) => {
            return GatewayError::SessionNotFound
                .to_http_response(format!("{e:#}"))
                .into_response();
        }
    };

    let path = dir.join(&query.name);
    match tokio::fs::write(&path, &body).await {
        Ok(()) => Json(UploadResponse {
            path: path.to_string_lossy().into_owned(),
            bytes: body.len(),
        })
        .into_response(),
        Err(e) => GatewayError::Internal
            .to_http_response(format!("writing upload failed: {e}"))
            .into_response(),
    }
}

/// Raw scrollback bytes; the browser re-feeds them to its emulator.
pub async fn session_buffer(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.manager.info(&id).await.is_none() {
        return GatewayError::SessionNotFound
            .to_http_response(format!("unknown session {id}"))
            .into_response();
    }
    match state.manager.buffer(&id).await {
        Ok(buffer) => (
            [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
            axum::body::Bytes::from(buffer),
        )
            .into_response(),
        Err(e) => GatewayError::HostUnreachable.to_http_response(format!("{e:#}")).into_response(),
    }
}
