// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary tests.
//!
//! Spawns the real `mthost` and `mtgate` binaries and exercises them over
//! their Unix socket, HTTP, and WebSocket surfaces.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Resolve the path to a compiled workspace binary.
pub fn binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs -> tests -> workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Make one raw HTTP/1.1 request and return `(status, body)`.
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    body: Option<&serde_json::Value>,
) -> anyhow::Result<(u16, Vec<u8>)> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{payload}",
        payload.len(),
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .context("no header terminator in response")?;
    let head = std::str::from_utf8(&response[..header_end])?;
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .context("no status code in response")?;

    // Re-join chunked bodies so callers see plain bytes.
    let raw_body = &response[header_end + 4..];
    let body = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        dechunk(raw_body)?
    } else {
        raw_body.to_vec()
    };
    Ok((status, body))
}

fn dechunk(mut raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = raw
            .windows(2)
            .position(|w| w == b"\r\n")
            .context("chunk header missing terminator")?;
        let size = usize::from_str_radix(std::str::from_utf8(&raw[..line_end])?.trim(), 16)?;
        raw = &raw[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        anyhow::ensure!(raw.len() >= size + 2, "truncated chunk");
        out.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

pub async fn http_get_json(port: u16, path: &str) -> anyhow::Result<serde_json::Value> {
    let (status, body) = http_request(port, "GET", path, None).await?;
    anyhow::ensure!(status == 200, "GET {path} returned {status}");
    Ok(serde_json::from_slice(&body)?)
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return Ok(());
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "condition never became true");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// A running `mtgate` process, killed on drop.
pub struct GatewayProcess {
    child: Child,
    pub port: u16,
}

impl GatewayProcess {
    pub fn start(service_mode: bool) -> anyhow::Result<Self> {
        let port = free_port()?;
        let mut cmd = Command::new(binary("mtgate"));
        cmd.arg("--port").arg(port.to_string()).arg("--bind").arg("127.0.0.1");
        if service_mode {
            cmd.arg("--service");
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd.spawn().context("spawning mtgate failed")?;
        Ok(Self { child, port })
    }

    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let port = self.port;
        wait_until(timeout, move || async move { http_get_json(port, "/api/health").await.is_ok() })
            .await
            .context("gateway never became healthy")
    }

    /// Create a session and return its info JSON.
    pub async fn create_session(&self, shell: &str) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({ "shell": shell, "cols": 80, "rows": 24 });
        let (status, response) =
            http_request(self.port, "POST", "/api/sessions", Some(&body)).await?;
        anyhow::ensure!(status == 200, "create returned {status}");
        Ok(serde_json::from_slice(&response)?)
    }

    pub async fn sessions(&self) -> anyhow::Result<serde_json::Value> {
        http_get_json(self.port, "/api/sessions").await
    }

    pub async fn close_session(&self, id: &str) -> anyhow::Result<()> {
        let (status, _) =
            http_request(self.port, "DELETE", &format!("/api/sessions/{id}"), None).await?;
        anyhow::ensure!(status == 200, "close returned {status}");
        Ok(())
    }

    /// Open the mux WebSocket.
    pub async fn connect_mux(&self) -> anyhow::Result<(MuxSink, MuxStream)> {
        let url = format!("ws://127.0.0.1:{}/ws/mux", self.port);
        let (socket, _response) = tokio_tungstenite::connect_async(&url).await?;
        let (tx, rx) = socket.split();
        Ok((tx, rx))
    }

    /// Kill abruptly, without closing sessions, like a crashed gateway.
    pub fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        std::mem::forget(self);
    }
}

impl Drop for GatewayProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub type MuxSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub type MuxStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Read binary frames until the accumulated output for `session_id`
/// contains `needle`, or the deadline passes.
pub async fn expect_output_containing(
    rx: &mut MuxStream,
    session_id: &str,
    needle: &[u8],
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut seen: Vec<u8> = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("deadline passed before expected output")?;
        let message = tokio::time::timeout(remaining, rx.next())
            .await
            .context("timed out waiting for output")?
            .context("mux socket closed")??;
        if let Message::Binary(data) = message {
            if let Ok(frame) = mtgate::mux_codec::try_parse_frame(&data) {
                if frame.kind == mtgate::mux_codec::MuxFrameType::Output
                    && frame.session_id == session_id
                    && frame.payload.len() >= 4
                {
                    seen.extend_from_slice(&frame.payload[4..]);
                    if seen.windows(needle.len().max(1)).any(|w| w == needle) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Read the Init greeting and return the 32-hex client id.
pub async fn expect_init(rx: &mut MuxStream, timeout: Duration) -> anyhow::Result<String> {
    let message = tokio::time::timeout(timeout, rx.next())
        .await
        .context("timed out waiting for init frame")?
        .context("mux socket closed")??;
    let Message::Binary(data) = message else {
        anyhow::bail!("expected binary init frame, got {message:?}");
    };
    anyhow::ensure!(data.first() == Some(&0xff), "first frame is not Init");
    let id = std::str::from_utf8(&data[mtgate::mux_codec::INIT_CLIENT_ID_OFFSET..])?;
    anyhow::ensure!(id.len() == 32, "client id has wrong length");
    Ok(id.to_owned())
}

/// Build an Input mux frame for `session_id`.
pub fn input_frame(session_id: &str, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x02];
    frame.extend_from_slice(session_id.as_bytes());
    frame.extend_from_slice(data);
    frame
}

/// Send input over the mux socket.
pub async fn send_input(tx: &mut MuxSink, session_id: &str, data: &[u8]) -> anyhow::Result<()> {
    tx.send(Message::Binary(input_frame(session_id, data).into())).await?;
    Ok(())
}
