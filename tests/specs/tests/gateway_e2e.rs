// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests for `mtgate` in direct (in-process PTY) mode.

use std::time::Duration;

use anyhow::Context;

use mterm_specs::{
    expect_init, expect_output_containing, http_request, send_input, GatewayProcess,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn session_id(info: &serde_json::Value) -> anyhow::Result<String> {
    Ok(info["id"].as_str().context("session info has no id")?.to_owned())
}

#[tokio::test]
async fn create_and_echo_over_mux() -> anyhow::Result<()> {
    let gateway = GatewayProcess::start(false)?;
    gateway.wait_healthy(TIMEOUT).await?;

    let info = gateway.create_session("bash").await?;
    let id = session_id(&info)?;
    assert_eq!(info["shell_type"], "bash");
    assert_eq!(info["is_running"], true);

    let (mut tx, mut rx) = gateway.connect_mux().await?;
    let client_id = expect_init(&mut rx, TIMEOUT).await?;
    assert_eq!(client_id.len(), 32);

    send_input(&mut tx, &id, b"echo gw-echo-marker\n").await?;
    expect_output_containing(&mut rx, &id, b"gw-echo-marker", TIMEOUT).await?;

    gateway.close_session(&id).await?;
    let sessions = gateway.sessions().await?;
    assert_eq!(sessions.as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn resize_is_reflected_in_session_list() -> anyhow::Result<()> {
    let gateway = GatewayProcess::start(false)?;
    gateway.wait_healthy(TIMEOUT).await?;

    let info = gateway.create_session("bash").await?;
    let id = session_id(&info)?;

    let body = serde_json::json!({ "cols": 120, "rows": 40 });
    let (status, _) =
        http_request(gateway.port, "POST", &format!("/api/sessions/{id}/resize"), Some(&body))
            .await?;
    anyhow::ensure!(status == 204, "resize returned {status}");

    let sessions = gateway.sessions().await?;
    let entry = sessions
        .as_array()
        .and_then(|list| list.iter().find(|s| s["id"] == id.as_str()))
        .context("session missing from list")?;
    assert_eq!(entry["cols"], 120);
    assert_eq!(entry["rows"], 40);

    gateway.close_session(&id).await?;
    Ok(())
}

#[tokio::test]
async fn out_of_range_resize_is_rejected() -> anyhow::Result<()> {
    let gateway = GatewayProcess::start(false)?;
    gateway.wait_healthy(TIMEOUT).await?;

    let info = gateway.create_session("bash").await?;
    let id = session_id(&info)?;

    for (cols, rows) in [(0u16, 24u16), (501, 24), (80, 0), (80, 501)] {
        let body = serde_json::json!({ "cols": cols, "rows": rows });
        let (status, _) =
            http_request(gateway.port, "POST", &format!("/api/sessions/{id}/resize"), Some(&body))
                .await?;
        anyhow::ensure!(status == 400, "resize {cols}x{rows} returned {status}");
    }

    gateway.close_session(&id).await?;
    Ok(())
}

#[tokio::test]
async fn uploads_land_in_the_session_drop_dir() -> anyhow::Result<()> {
    let gateway = GatewayProcess::start(false)?;
    gateway.wait_healthy(TIMEOUT).await?;

    let info = gateway.create_session("bash").await?;
    let id = session_id(&info)?;

    let body = serde_json::json!("drop payload");
    let (status, response) = http_request(
        gateway.port,
        "POST",
        &format!("/api/sessions/{id}/upload?name=notes.txt"),
        Some(&body),
    )
    .await?;
    anyhow::ensure!(status == 200, "upload returned {status}");

    let uploaded: serde_json::Value = serde_json::from_slice(&response)?;
    let path = uploaded["path"].as_str().context("upload response has no path")?;
    anyhow::ensure!(path.contains("mm-drops"), "upload path {path} outside drop dir");
    let written = std::fs::read_to_string(path)?;
    assert_eq!(written, body.to_string());

    // Traversal attempts are refused outright.
    let (status, _) = http_request(
        gateway.port,
        "POST",
        &format!("/api/sessions/{id}/upload?name=..%2Fescape"),
        Some(&body),
    )
    .await?;
    assert_eq!(status, 400);

    // Closing the session removes its drop directory.
    gateway.close_session(&id).await?;
    assert!(!std::path::Path::new(path).exists());
    Ok(())
}

#[tokio::test]
async fn unknown_session_returns_not_found() -> anyhow::Result<()> {
    let gateway = GatewayProcess::start(false)?;
    gateway.wait_healthy(TIMEOUT).await?;

    let (status, _) =
        http_request(gateway.port, "GET", "/api/sessions/deadbeef/buffer", None).await?;
    assert_eq!(status, 404);

    let (status, _) =
        http_request(gateway.port, "DELETE", "/api/sessions/deadbeef", None).await?;
    assert_eq!(status, 404);
    Ok(())
}

#[tokio::test]
async fn named_sessions_keep_manual_names() -> anyhow::Result<()> {
    let gateway = GatewayProcess::start(false)?;
    gateway.wait_healthy(TIMEOUT).await?;

    let info = gateway.create_session("bash").await?;
    let id = session_id(&info)?;

    let body = serde_json::json!({ "name": "deploy", "manual": true });
    let (status, _) =
        http_request(gateway.port, "POST", &format!("/api/sessions/{id}/name"), Some(&body))
            .await?;
    anyhow::ensure!(status == 204, "name returned {status}");

    // A shell-title style auto update must not overwrite it.
    let body = serde_json::json!({ "name": "auto", "manual": false });
    let (status, _) =
        http_request(gateway.port, "POST", &format!("/api/sessions/{id}/name"), Some(&body))
            .await?;
    anyhow::ensure!(status == 204, "auto name returned {status}");

    let sessions = gateway.sessions().await?;
    let entry = sessions
        .as_array()
        .and_then(|list| list.iter().find(|s| s["id"] == id.as_str()))
        .context("session missing from list")?;
    assert_eq!(entry["name"], "deploy");
    assert_eq!(entry["manually_named"], true);

    gateway.close_session(&id).await?;
    Ok(())
}
