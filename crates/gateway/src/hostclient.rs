// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host IPC client.
//!
//! One instance per session. Requests are serialized per connection and
//! paired with their acks by type, so no correlation ids are needed; on
//! transport loss the client re-establishes the connection with exponential
//! backoff and re-runs the handshake.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mthost::ipc;
use mthost::protocol::{self, MsgType, StateChange};
use mthost::session_info::{ForegroundProcessInfo, SessionInfo};

/// Initial-connect attempts and per-attempt backoff step.
pub const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF_STEP: Duration = Duration::from_millis(200);

/// Per-request response deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the initial connect + handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect gives up after this many attempts.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Backoff before initial-connect attempt `attempt + 1` (so after the
/// first failure the wait is one step, after the second two).
pub fn connect_delay(attempt: u32) -> Duration {
    CONNECT_BACKOFF_STEP * attempt
}

/// Backoff before reconnect attempt `attempt` (0-based): doubling from
/// 100 ms, capped at 5 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    exp.min(RECONNECT_MAX_DELAY)
}

/// Everything a session owner can observe about its host.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Output { cols: u16, rows: u16, data: Bytes },
    State(StateChange),
    Foreground(ForegroundProcessInfo),
    /// Connection re-established; carries the fresh handshake snapshot.
    Reconnected(Box<SessionInfo>),
    Disconnected,
}

struct Pending {
    expect: MsgType,
    tx: oneshot::Sender<Bytes>,
}

pub struct HostClient {
    path: PathBuf,
    conn: tokio::sync::RwLock<Option<Arc<UnixStream>>>,
    /// Serializes frame writes on the active stream.
    write_lock: tokio::sync::Mutex<()>,
    /// Serializes whole request/response exchanges so acks cannot be
    /// routed to the wrong caller.
    request_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<Pending>>,
    events_tx: broadcast::Sender<HostEvent>,
    /// Set by `close()`; suppresses reconnect for good.
    closed: AtomicBool,
    reconnecting: AtomicBool,
    gave_up: AtomicBool,
    shutdown: CancellationToken,
}

impl HostClient {
    fn new(path: PathBuf) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            path,
            conn: tokio::sync::RwLock::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            request_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            events_tx,
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            gave_up: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Connect with retries and run the handshake.
    pub async fn connect(
        path: PathBuf,
        timeout: Duration,
    ) -> anyhow::Result<(Arc<Self>, SessionInfo)> {
        let client = Self::new(path);
        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match client.establish(timeout).await {
                Ok(info) => return Ok((client, info)),
                Err(e) => {
                    debug!(attempt, err = format!("{e:#}"), "host connect attempt failed");
                    last_err = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(connect_delay(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("host connect failed")))
    }

    /// Single connect attempt, no retries. Used by poll-connect loops.
    pub async fn connect_once(
        path: PathBuf,
        timeout: Duration,
    ) -> anyhow::Result<(Arc<Self>, SessionInfo)> {
        let client = Self::new(path);
        let info = client.establish(timeout).await?;
        Ok((client, info))
    }

    /// Connect the socket and run the `GetInfo` handshake inline. The read
    /// loop starts only afterwards, so the handshake reply is read directly
    /// off the stream without racing the loop for the first frame.
    async fn establish(self: &Arc<Self>, timeout: Duration) -> anyhow::Result<SessionInfo> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(&self.path))
            .await
            .context("host connect timed out")?
            .with_context(|| format!("connecting {} failed", self.path.display()))?;
        let stream = Arc::new(stream);

        ipc::write_frame(&stream, MsgType::GetInfo, &[]).await.context("handshake write failed")?;
        let info = loop {
            let (msg, payload) = tokio::time::timeout(timeout, ipc::read_frame(&stream))
                .await
                .context("handshake timed out")??;
            match msg {
                MsgType::Info => break protocol::decode_info(&payload)?,
                other => {
                    // Nothing else is expected before Info; tolerate and
                    // keep waiting rather than poisoning the handshake.
                    warn!(msg = ?other, "unexpected frame during handshake");
                }
            }
        };

        *self.conn.write().await = Some(Arc::clone(&stream));
        let client = Arc::clone(self);
        tokio::spawn(client.read_loop(stream));
        Ok(info)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events_tx.subscribe()
    }

    /// True once the client has exhausted its reconnect budget.
    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::SeqCst)
    }

    async fn current_stream(&self) -> Option<Arc<UnixStream>> {
        self.conn.read().await.clone()
    }

    async fn write(&self, stream: &UnixStream, msg: MsgType, payload: &[u8]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        ipc::write_frame(stream, msg, payload).await?;
        Ok(())
    }

    /// One serialized request/response exchange.
    async fn request(self: &Arc<Self>, msg: MsgType, payload: &[u8]) -> anyhow::Result<Bytes> {
        let expect = match msg.ack() {
            Some(ack) => ack,
            None => anyhow::bail!("{msg:?} is not a request type"),
        };

        let _serial = self.request_lock.lock().await;
        let stream = self.current_stream().await.context("host not connected")?;

        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(Pending { expect, tx });

        if let Err(e) = self.write(&stream, msg, payload).await {
            self.pending.lock().take();
            self.trigger_reconnect();
            return Err(e.context("request write failed"));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => anyhow::bail!("connection lost mid-request"),
            Err(_) => {
                self.pending.lock().take();
                anyhow::bail!("{msg:?} request timed out")
            }
        }
    }

    pub async fn get_info(self: &Arc<Self>) -> anyhow::Result<SessionInfo> {
        let payload = self.request(MsgType::GetInfo, &[]).await?;
        Ok(protocol::decode_info(&payload)?)
    }

    pub async fn get_buffer(self: &Arc<Self>) -> anyhow::Result<Bytes> {
        self.request(MsgType::GetBuffer, &[]).await
    }

    pub async fn resize(self: &Arc<Self>, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.request(MsgType::Resize, &protocol::encode_resize(cols, rows)).await?;
        Ok(())
    }

    pub async fn set_name(
        self: &Arc<Self>,
        name: Option<&str>,
        manual: bool,
    ) -> anyhow::Result<()> {
        self.request(MsgType::SetName, &protocol::encode_set_name(name, manual)).await?;
        Ok(())
    }

    pub async fn set_order(self: &Arc<Self>, order: u8) -> anyhow::Result<()> {
        self.request(MsgType::SetOrder, &[order]).await?;
        Ok(())
    }

    pub async fn set_log_level(self: &Arc<Self>, level: &str) -> anyhow::Result<()> {
        self.request(MsgType::SetLogLevel, level.as_bytes()).await?;
        Ok(())
    }

    /// Fire-and-forget input. Write failures trigger a reconnect but are
    /// not surfaced to the caller.
    pub async fn send_input(self: &Arc<Self>, data: &[u8]) {
        let Some(stream) = self.current_stream().await else {
            debug!("input dropped: host not connected");
            return;
        };
        if let Err(e) = self.write(&stream, MsgType::Input, data).await {
            debug!(err = %e, "input write failed");
            self.trigger_reconnect();
        }
    }

    /// Close the session: the host acks, kills its PTY, and exits.
    pub async fn close(self: &Arc<Self>) -> anyhow::Result<()> {
        // Mark closed first so the read loop treats the host hanging up
        // right after CloseAck as expected, not as a reconnect trigger.
        self.closed.store(true, Ordering::SeqCst);
        let result = self.request(MsgType::Close, &[]).await;
        self.shutdown.cancel();
        *self.conn.write().await = None;
        result.map(|_| ())
    }

    async fn read_loop(self: Arc<Self>, stream: Arc<UnixStream>) {
        loop {
            let frame = tokio::select! {
                frame = ipc::read_frame(&stream) => frame,
                _ = self.shutdown.cancelled() => return,
            };
            match frame {
                Ok((msg, payload)) => self.dispatch_frame(msg, payload),
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    // A superseded loop must not tear down a healthy
                    // replacement connection.
                    let still_current = self
                        .current_stream()
                        .await
                        .is_some_and(|current| Arc::ptr_eq(&current, &stream));
                    if !still_current {
                        return;
                    }
                    debug!(err = %e, "host connection lost");
                    let _ = self.events_tx.send(HostEvent::Disconnected);
                    self.trigger_reconnect();
                    return;
                }
            }
        }
    }

    fn dispatch_frame(&self, msg: MsgType, payload: Bytes) {
        match msg {
            MsgType::Output => match protocol::decode_output(&payload) {
                Ok((cols, rows, data)) => {
                    let _ = self.events_tx.send(HostEvent::Output { cols, rows, data });
                }
                Err(e) => warn!(err = %e, "bad output payload"),
            },
            MsgType::StateChange => match protocol::decode_state_change(&payload) {
                Ok(state) => {
                    let _ = self.events_tx.send(HostEvent::State(state));
                }
                Err(e) => warn!(err = %e, "bad state payload"),
            },
            MsgType::ForegroundChange => match protocol::decode_foreground(&payload) {
                Ok(fg) => {
                    let _ = self.events_tx.send(HostEvent::Foreground(fg));
                }
                Err(e) => warn!(err = %e, "bad foreground payload"),
            },
            MsgType::Info
            | MsgType::Buffer
            | MsgType::ResizeAck
            | MsgType::SetNameAck
            | MsgType::SetOrderAck
            | MsgType::SetLogLevelAck
            | MsgType::CloseAck => {
                let mut slot = self.pending.lock();
                match slot.take() {
                    Some(pending) if pending.expect == msg => {
                        drop(slot);
                        let _ = pending.tx.send(payload);
                    }
                    Some(pending) => {
                        warn!(got = ?msg, expected = ?pending.expect, "mismatched ack, discarding");
                        *slot = Some(pending);
                    }
                    None => warn!(msg = ?msg, "ack with no pending request"),
                }
            }
            other => warn!(msg = ?other, "unexpected frame from host"),
        }
    }

    fn trigger_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.gave_up() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(client.reconnect_loop());
    }

    async fn reconnect_loop(self: Arc<Self>) {
        *self.conn.write().await = None;

        for attempt in 0..RECONNECT_MAX_ATTEMPTS {
            tokio::time::sleep(reconnect_delay(attempt)).await;
            if self.closed.load(Ordering::SeqCst) {
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            match self.establish(REQUEST_TIMEOUT).await {
                Ok(info) => {
                    info!(attempt, path = %self.path.display(), "host reconnected");
                    self.reconnecting.store(false, Ordering::SeqCst);
                    let _ = self.events_tx.send(HostEvent::Reconnected(Box::new(info)));
                    return;
                }
                Err(e) => {
                    debug!(attempt, err = format!("{e:#}"), "reconnect attempt failed");
                }
            }
        }

        warn!(
            path = %self.path.display(),
            "giving up after {RECONNECT_MAX_ATTEMPTS} reconnect attempts"
        );
        self.gave_up.store(true, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        let _ = self
            .events_tx
            .send(HostEvent::State(StateChange { is_running: false, exit_code: None }));
    }
}

#[cfg(test)]
#[path = "hostclient_tests.rs"]
mod tests;
