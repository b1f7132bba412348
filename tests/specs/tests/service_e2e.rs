// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests for service mode: per-session host processes that
//! survive gateway restarts.

use std::time::Duration;

use anyhow::Context;
use serial_test::file_serial;

use mterm_specs::{
    expect_init, expect_output_containing, http_request, send_input, wait_until, GatewayProcess,
};

const TIMEOUT: Duration = Duration::from_secs(15);

fn session_id(info: &serde_json::Value) -> anyhow::Result<String> {
    Ok(info["id"].as_str().context("session info has no id")?.to_owned())
}

#[tokio::test]
#[file_serial(mterm_hosts)]
async fn sessions_survive_gateway_restart() -> anyhow::Result<()> {
    let first = GatewayProcess::start(true)?;
    first.wait_healthy(TIMEOUT).await?;

    let info = first.create_session("bash").await?;
    let id = session_id(&info)?;
    let shell_pid = info["pid"].as_u64().context("no pid in session info")?;

    // Produce output that must survive the restart in host scrollback.
    let (mut tx, mut rx) = first.connect_mux().await?;
    let _client = expect_init(&mut rx, TIMEOUT).await?;
    send_input(&mut tx, &id, b"echo restart-survivor\n").await?;
    expect_output_containing(&mut rx, &id, b"restart-survivor", TIMEOUT).await?;

    // Abrupt gateway death: the host keeps running.
    first.kill();

    let second = GatewayProcess::start(true)?;
    second.wait_healthy(TIMEOUT).await?;

    // Discovery re-registers the surviving session with the same shell.
    let port = second.port;
    let id_for_poll = id.clone();
    wait_until(Duration::from_secs(3), move || {
        let id = id_for_poll.clone();
        async move {
            match mterm_specs::http_get_json(port, "/api/sessions").await {
                Ok(sessions) => sessions
                    .as_array()
                    .is_some_and(|list| list.iter().any(|s| s["id"] == id.as_str())),
                Err(_) => false,
            }
        }
    })
    .await
    .context("restarted gateway never rediscovered the session")?;

    let sessions = second.sessions().await?;
    let entry = sessions
        .as_array()
        .and_then(|list| list.iter().find(|s| s["id"] == id.as_str()))
        .context("session missing after restart")?;
    assert_eq!(entry["pid"].as_u64(), Some(shell_pid));

    // A fresh browser gets the pre-restart output as its snapshot.
    let (_tx2, mut rx2) = second.connect_mux().await?;
    let _client = expect_init(&mut rx2, TIMEOUT).await?;
    expect_output_containing(&mut rx2, &id, b"restart-survivor", TIMEOUT).await?;

    second.close_session(&id).await?;
    Ok(())
}

#[tokio::test]
#[file_serial(mterm_hosts)]
async fn dead_host_stays_listed_until_closed() -> anyhow::Result<()> {
    let gateway = GatewayProcess::start(true)?;
    gateway.wait_healthy(TIMEOUT).await?;

    let info = gateway.create_session("bash").await?;
    let id = session_id(&info)?;
    let host_pid = info["host_pid"].as_u64().context("no host_pid")? as i32;

    // Crash the host out from under the gateway.
    let _ = kill_process(host_pid);

    // The session stays in the list while the client retries; its buffer
    // is unreachable though.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let sessions = gateway.sessions().await?;
    let listed = sessions
        .as_array()
        .is_some_and(|list| list.iter().any(|s| s["id"] == id.as_str()));
    assert!(listed, "session vanished from list after host crash");

    let (status, _) =
        http_request(gateway.port, "GET", &format!("/api/sessions/{id}/buffer"), None).await?;
    anyhow::ensure!(status != 200, "buffer unexpectedly available from dead host");

    // The shell outlives its murdered host; reap it so nothing leaks.
    if let Some(shell_pid) = info["pid"].as_u64() {
        let _ = kill_process(shell_pid as i32);
    }
    Ok(())
}

fn kill_process(pid: i32) -> std::io::Result<()> {
    let status = std::process::Command::new("kill").arg("-9").arg(pid.to_string()).status()?;
    if !status.success() {
        return Err(std::io::Error::other("kill failed"));
    }
    Ok(())
}
