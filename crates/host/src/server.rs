// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host IPC server.
//!
//! Binds the session's Unix socket and serves the framed request/response
//! protocol with streamed output. At most one client is active at a time:
//! a new connection supersedes the old one, whose scope is cancelled and
//! allowed to drain naturally; the gateway is the only legitimate caller,
//! so a second connection means the gateway restarted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::{self, endpoint_path};
use crate::protocol::{self, MsgType, StateChange};
use crate::session_info::ForegroundProcessInfo;
use crate::supervisor::{OutputEvent, PtySupervisor};

/// A client that never completes its `GetInfo` handshake is dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport validity check cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Replayed scrollback is framed in chunks of this size.
const REPLAY_CHUNK: usize = 64 * 1024;

/// Runtime log-level override installed by `run()`.
pub type LogLevelSetter = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Offset gate between handshake replay and live output.
///
/// Tracks the highest scrollback cursor already written to this client.
/// `None` until the handshake replay fixes the starting point; live events
/// below the high-water mark are dropped or sliced so each byte reaches
/// the client exactly once.
#[derive(Debug, Default)]
struct ReplayGate {
    high_water: Option<u64>,
}

impl ReplayGate {
    /// Record the cursor the handshake replay reached.
    fn commit(&mut self, cursor: u64) {
        self.high_water = Some(self.high_water.map_or(cursor, |hw| hw.max(cursor)));
    }

    /// Number of leading bytes of a live event to skip, or `None` to drop
    /// the event entirely.
    fn on_event(&mut self, cursor: u64, len: usize) -> Option<usize> {
        let hw = self.high_water?;
        if cursor <= hw {
            return None;
        }
        let start = cursor - len as u64;
        let skip = hw.saturating_sub(start) as usize;
        self.high_water = Some(cursor);
        Some(skip)
    }
}

pub struct IpcServer {
    supervisor: Arc<PtySupervisor>,
    shutdown: CancellationToken,
    log_level: Option<LogLevelSetter>,
    path: PathBuf,
}

impl IpcServer {
    pub fn new(
        supervisor: Arc<PtySupervisor>,
        shutdown: CancellationToken,
        log_level: Option<LogLevelSetter>,
    ) -> Self {
        let path = endpoint_path(supervisor.session_id(), std::process::id());
        Self { supervisor, shutdown, log_level, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept clients until shutdown. The endpoint file is unlinked on exit.
    pub async fn run(&self) -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)
            .with_context(|| format!("binding host endpoint {} failed", self.path.display()))?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting {} failed", self.path.display()))?;
        info!(path = %self.path.display(), "host endpoint listening");

        let mut active: Option<CancellationToken> = None;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            // Supersede the previous client; its tasks
                            // observe cancellation and drain on their own.
                            if let Some(prev) = active.take() {
                                debug!("new client supersedes active connection");
                                prev.cancel();
                            }
                            let token = self.shutdown.child_token();
                            active = Some(token.clone());
                            let conn = Connection {
                                stream: Arc::new(stream),
                                supervisor: Arc::clone(&self.supervisor),
                                token,
                                shutdown: self.shutdown.clone(),
                                write_lock: Arc::new(tokio::sync::Mutex::new(())),
                                log_level: self.log_level.clone(),
                            };
                            tokio::spawn(conn.run());
                        }
                        Err(e) => warn!(err = %e, "accept failed"),
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}

enum Flow {
    Continue,
    Close,
}

struct Connection {
    stream: Arc<UnixStream>,
    supervisor: Arc<PtySupervisor>,
    /// Scope of this client; cancelled on supersession, heartbeat failure,
    /// handshake timeout, or process shutdown.
    token: CancellationToken,
    /// Process-wide shutdown, cancelled by `Close`.
    shutdown: CancellationToken,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    log_level: Option<LogLevelSetter>,
}

impl Connection {
    async fn run(self) {
        // Reading the PTY only starts once a client is attached, so the
        // scrollback at handshake time is the complete output history.
        self.supervisor.start_read_loop();

        tokio::spawn(heartbeat(Arc::clone(&self.stream), self.token.clone()));

        let gate = Arc::new(Mutex::new(ReplayGate::default()));
        tokio::spawn(output_pump(
            Arc::clone(&self.stream),
            Arc::clone(&self.write_lock),
            self.supervisor.subscribe_output(),
            Arc::clone(&gate),
            self.token.clone(),
        ));

        let mut handshaken = false;
        let handshake_deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let frame = tokio::select! {
                frame = ipc::read_frame(&self.stream) => frame,
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep_until(handshake_deadline), if !handshaken => {
                    warn!("client never completed handshake, dropping");
                    self.token.cancel();
                    return;
                }
            };

            let (msg, payload) = match frame {
                Ok(frame) => frame,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!(err = %e, "malformed frame, closing client");
                    self.token.cancel();
                    return;
                }
                Err(e) => {
                    debug!(err = %e, "client connection lost");
                    self.token.cancel();
                    return;
                }
            };

            // Dispatch serially. Failures are logged and the loop continues;
            // only Close escalates to process shutdown.
            match self.dispatch(msg, &payload, &mut handshaken, &gate).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => return,
                Err(e) => warn!(msg = ?msg, err = format!("{e:#}"), "request failed"),
            }
        }
    }

    async fn dispatch(
        &self,
        msg: MsgType,
        payload: &[u8],
        handshaken: &mut bool,
        gate: &Arc<Mutex<ReplayGate>>,
    ) -> anyhow::Result<Flow> {
        match msg {
            MsgType::GetInfo => {
                self.handshake(handshaken, gate).await?;
            }
            MsgType::Input => {
                self.supervisor.send_input(payload).await;
            }
            MsgType::Resize => {
                let (cols, rows) = protocol::decode_resize(payload)?;
                if let Err(e) = self.supervisor.resize(cols, rows) {
                    warn!(cols, rows, err = %e, "resize rejected");
                }
                self.write(MsgType::ResizeAck, &[]).await?;
            }
            MsgType::GetBuffer => {
                let snapshot = self.supervisor.buffer_snapshot();
                // Scrollback capacity (up to 64 MiB) can exceed the frame
                // payload cap; the reply carries the newest bytes that fit.
                let start = snapshot.len().saturating_sub(protocol::MAX_PAYLOAD);
                self.write(MsgType::Buffer, &snapshot[start..]).await?;
            }
            MsgType::SetName => {
                let (name, manual) = protocol::decode_set_name(payload)?;
                self.supervisor.set_name(name, manual);
                self.write(MsgType::SetNameAck, &[]).await?;
            }
            MsgType::SetOrder => {
                let order = protocol::decode_set_order(payload)?;
                self.supervisor.set_order(order);
                self.write(MsgType::SetOrderAck, &[]).await?;
            }
            MsgType::SetLogLevel => {
                let level = protocol::decode_set_log_level(payload)?;
                match &self.log_level {
                    Some(setter) => {
                        if let Err(e) = setter(&level) {
                            warn!(level, err = %e, "log level change rejected");
                        }
                    }
                    None => warn!(level, "no runtime log handle installed"),
                }
                self.write(MsgType::SetLogLevelAck, &[]).await?;
            }
            MsgType::Close => {
                self.write(MsgType::CloseAck, &[]).await?;
                self.supervisor.kill().await;
                info!("close requested, shutting down host");
                self.shutdown.cancel();
                return Ok(Flow::Close);
            }
            other => {
                warn!(msg = ?other, "unexpected message from client, discarding");
            }
        }
        Ok(Flow::Continue)
    }

    /// `GetInfo`: fix the replay cursor, respond, then replay scrollback
    /// captured before live delivery began.
    async fn handshake(
        &self,
        handshaken: &mut bool,
        gate: &Arc<Mutex<ReplayGate>>,
    ) -> anyhow::Result<()> {
        // Cursor must be captured before the response goes out.
        let cursor = self.supervisor.output_cursor();
        let info = self.supervisor.info();
        let payload = protocol::encode_info(&info)?;

        // The write lock is held from Info through the last replay chunk
        // so the output pump cannot interleave a live frame mid-replay.
        let _guard = self.write_lock.lock().await;
        ipc::write_frame(&self.stream, MsgType::Info, &payload).await?;

        if *handshaken {
            // Re-issued GetInfo refreshes the snapshot only; event
            // subscriptions and replay happen once per connection, since
            // duplicate handlers would multiply every later message.
            return Ok(());
        }
        *handshaken = true;

        // Capture and commit under the gate lock: an event recorded in the
        // ring during capture is covered by the replay, and one recorded
        // after it sees the committed high-water mark. Either way each
        // byte goes out exactly once.
        let replay = {
            let mut gate = gate.lock();
            let (replay, end) = match self.supervisor.replay_since(cursor) {
                Some(data) => {
                    let end = cursor + data.len() as u64;
                    (data, end)
                }
                None => {
                    warn!(cursor, "scrollback too small for handshake replay, sending snapshot");
                    self.supervisor.snapshot_with_cursor()
                }
            };
            gate.commit(end);
            replay
        };

        let (cols, rows) = self.supervisor.dims();
        for chunk in replay.chunks(REPLAY_CHUNK) {
            let framed = protocol::encode_output(cols, rows, chunk);
            ipc::write_frame(&self.stream, MsgType::Output, &framed).await?;
        }

        // First completed handshake subscribes the state and foreground
        // streams, exactly once for the connection's lifetime.
        tokio::spawn(state_pump(
            Arc::clone(&self.stream),
            Arc::clone(&self.write_lock),
            Arc::clone(&self.supervisor),
            self.supervisor.subscribe_state(),
            self.token.clone(),
        ));
        tokio::spawn(foreground_pump(
            Arc::clone(&self.stream),
            Arc::clone(&self.write_lock),
            self.supervisor.subscribe_foreground(),
            self.token.clone(),
        ));

        Ok(())
    }

    async fn write(&self, msg: MsgType, payload: &[u8]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        ipc::write_frame(&self.stream, msg, payload).await?;
        Ok(())
    }
}

/// Forward live output, sliced through the replay gate.
async fn output_pump(
    stream: Arc<UnixStream>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    mut rx: broadcast::Receiver<OutputEvent>,
    gate: Arc<Mutex<ReplayGate>>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = token.cancelled() => break,
        };
        match event {
            Ok(event) => {
                let skip = match gate.lock().on_event(event.cursor, event.data.len()) {
                    Some(skip) => skip,
                    // Pre-handshake or already replayed.
                    None => continue,
                };
                let payload = protocol::encode_output(event.cols, event.rows, &event.data[skip..]);
                let _guard = write_lock.lock().await;
                if let Err(e) = ipc::write_frame(&stream, MsgType::Output, &payload).await {
                    debug!(err = %e, "output write failed");
                    token.cancel();
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // The gap stays in scrollback; the gateway refetches via
                // GetBuffer when it notices.
                warn!(missed, "output subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Forward state transitions as `StateChange` frames.
async fn state_pump(
    stream: Arc<UnixStream>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    supervisor: Arc<PtySupervisor>,
    mut rx: broadcast::Receiver<()>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = token.cancelled() => break,
        };
        match event {
            Ok(()) => {
                let info = supervisor.info();
                let payload = protocol::encode_state_change(StateChange {
                    is_running: info.is_running,
                    exit_code: info.exit_code,
                });
                let _guard = write_lock.lock().await;
                if ipc::write_frame(&stream, MsgType::StateChange, &payload).await.is_err() {
                    token.cancel();
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Forward foreground-process observations.
async fn foreground_pump(
    stream: Arc<UnixStream>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    mut rx: broadcast::Receiver<ForegroundProcessInfo>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = token.cancelled() => break,
        };
        match event {
            Ok(fg) => {
                let payload = match protocol::encode_foreground(&fg) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(err = %e, "foreground encode failed");
                        continue;
                    }
                };
                let _guard = write_lock.lock().await;
                if ipc::write_frame(&stream, MsgType::ForegroundChange, &payload).await.is_err() {
                    token.cancel();
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Periodically verify the transport is still alive; readiness reporting
/// an error or closed half cancels the client scope.
async fn heartbeat(stream: Arc<UnixStream>, token: CancellationToken) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = token.cancelled() => break,
        }
        match stream.ready(Interest::WRITABLE | Interest::ERROR).await {
            Ok(ready) if ready.is_error() || ready.is_write_closed() || ready.is_read_closed() => {
                debug!("heartbeat detected dead transport");
                token.cancel();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(err = %e, "heartbeat check failed");
                token.cancel();
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
