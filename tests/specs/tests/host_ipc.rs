// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests for the `mthost` binary over its Unix socket.

use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use serial_test::file_serial;
use tokio::net::UnixStream;

use mterm_specs::binary;
use mthost::ipc;
use mthost::protocol::{self, MsgType};

const TIMEOUT: Duration = Duration::from_secs(10);

struct HostProcess {
    child: std::process::Child,
    _tmp: tempfile::TempDir,
    socket: std::path::PathBuf,
    session_id: String,
}

fn spawn_host(session_id: &str) -> anyhow::Result<HostProcess> {
    let tmp = tempfile::tempdir()?;
    let mut cmd = Command::new(binary("mthost"));
    cmd.arg("--session")
        .arg(session_id)
        .arg("--shell")
        .arg("bash")
        .arg("--cwd")
        .arg("/tmp")
        .arg("--cols")
        .arg("80")
        .arg("--rows")
        .arg("24")
        // Isolate the endpoint file from any other host on the machine.
        .env("TMPDIR", tmp.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn().context("spawning mthost failed")?;
    let socket = tmp.path().join(format!("mthost-{session_id}-{}.sock", child.id()));
    Ok(HostProcess { child, _tmp: tmp, socket, session_id: session_id.to_owned() })
}

impl HostProcess {
    async fn connect(&self) -> anyhow::Result<UnixStream> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Ok(stream) = UnixStream::connect(&self.socket).await {
                return Ok(stream);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "host socket never appeared at {}",
                self.socket.display()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn handshake(stream: &UnixStream, session_id: &str) -> anyhow::Result<()> {
    ipc::write_frame(stream, MsgType::GetInfo, &[]).await?;
    let (msg, payload) = tokio::time::timeout(TIMEOUT, ipc::read_frame(stream)).await??;
    anyhow::ensure!(msg == MsgType::Info, "expected Info, got {msg:?}");
    let info = protocol::decode_info(&payload)?;
    anyhow::ensure!(info.id == session_id, "session id mismatch");
    anyhow::ensure!(info.is_running, "session not running after spawn");
    Ok(())
}

/// Read frames until the concatenated Output bytes contain `needle`.
async fn read_output_until(stream: &UnixStream, needle: &[u8]) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let mut seen: Vec<u8> = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("expected output never arrived")?;
        let (msg, payload) = tokio::time::timeout(remaining, ipc::read_frame(stream)).await??;
        if msg == MsgType::Output {
            let (_, _, data) = protocol::decode_output(&payload)?;
            seen.extend_from_slice(&data);
            if seen.windows(needle.len()).any(|w| w == needle) {
                return Ok(());
            }
        }
    }
}

#[tokio::test]
#[file_serial(mterm_hosts)]
async fn create_and_echo() -> anyhow::Result<()> {
    let host = spawn_host("00c0ffee")?;
    let stream = host.connect().await?;
    handshake(&stream, &host.session_id).await?;

    ipc::write_frame(&stream, MsgType::Input, b"echo mt-echo-marker\n").await?;
    read_output_until(&stream, b"mt-echo-marker").await?;

    // The marker is also in scrollback now.
    ipc::write_frame(&stream, MsgType::GetBuffer, &[]).await?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("buffer never arrived")?;
        let (msg, payload) = tokio::time::timeout(remaining, ipc::read_frame(&stream)).await??;
        if msg == MsgType::Buffer {
            anyhow::ensure!(
                payload.windows(14).any(|w| w == b"mt-echo-marker"),
                "scrollback missing echoed marker"
            );
            break;
        }
    }
    Ok(())
}

#[tokio::test]
#[file_serial(mterm_hosts)]
async fn resize_and_close() -> anyhow::Result<()> {
    let mut host = spawn_host("00c0ffe1")?;
    let stream = host.connect().await?;
    handshake(&stream, &host.session_id).await?;

    ipc::write_frame(&stream, MsgType::Resize, &protocol::encode_resize(120, 40)).await?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("resize ack never arrived")?;
        let (msg, _) = tokio::time::timeout(remaining, ipc::read_frame(&stream)).await??;
        if msg == MsgType::ResizeAck {
            break;
        }
    }

    // Refresh info to confirm the new dimensions.
    ipc::write_frame(&stream, MsgType::GetInfo, &[]).await?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("info never arrived")?;
        let (msg, payload) = tokio::time::timeout(remaining, ipc::read_frame(&stream)).await??;
        if msg == MsgType::Info {
            let info = protocol::decode_info(&payload)?;
            anyhow::ensure!((info.cols, info.rows) == (120, 40), "resize not applied");
            break;
        }
    }

    // Close: ack first, then the whole process exits.
    ipc::write_frame(&stream, MsgType::Close, &[]).await?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("close ack never arrived")?;
        let (msg, _) = tokio::time::timeout(remaining, ipc::read_frame(&stream)).await??;
        if msg == MsgType::CloseAck {
            break;
        }
    }

    let deadline = std::time::Instant::now() + TIMEOUT;
    loop {
        if let Ok(Some(_status)) = host.child.try_wait() {
            break;
        }
        anyhow::ensure!(std::time::Instant::now() < deadline, "host never exited after close");
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}
