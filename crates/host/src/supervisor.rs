// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session PTY supervisor: read loop, scrollback capture, attribute
//! state, and event fanout.
//!
//! Event channels are tokio broadcasts so a slow subscriber can never stall
//! the PTY read loop; anything a laggy subscriber misses is recoverable
//! from the scrollback.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::pty::PtyConnection;
use crate::scrollback::Scrollback;
use crate::session_info::{epoch_ms, ForegroundProcessInfo, SessionInfo, ShellType};
use crate::title::TitleScanner;

/// PTY read size.
const READ_BUF_LEN: usize = 8192;

/// Smallest and largest accepted terminal dimensions.
pub const MIN_DIM: u16 = 1;
pub const MAX_DIM: u16 = 500;

/// A chunk of shell output, tagged with the scrollback cursor after append.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub cols: u16,
    pub rows: u16,
    /// `total_written` of the scrollback immediately after this chunk.
    pub cursor: u64,
    pub data: Bytes,
}

/// Mutable session attributes guarded together.
#[derive(Debug, Default)]
struct Attrs {
    name: Option<String>,
    terminal_title: Option<String>,
    manually_named: bool,
    order: u8,
    current_working_directory: Option<String>,
    foreground: Option<ForegroundProcessInfo>,
    running: bool,
    exit_code: Option<i32>,
}

pub struct PtySupervisor {
    session_id: String,
    shell: ShellType,
    created_at: u64,
    host_pid: u32,
    pty: Box<dyn PtyConnection>,
    ring: Mutex<Scrollback>,
    attrs: Mutex<Attrs>,
    cols: AtomicU16,
    rows: AtomicU16,
    read_loop_started: AtomicBool,
    output_tx: broadcast::Sender<OutputEvent>,
    state_tx: broadcast::Sender<()>,
    foreground_tx: broadcast::Sender<ForegroundProcessInfo>,
}

impl PtySupervisor {
    pub fn new(
        session_id: String,
        shell: ShellType,
        pty: Box<dyn PtyConnection>,
        scrollback_capacity: usize,
        cols: u16,
        rows: u16,
    ) -> Arc<Self> {
        let (output_tx, _) = broadcast::channel(1024);
        let (state_tx, _) = broadcast::channel(64);
        let (foreground_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            session_id,
            shell,
            created_at: epoch_ms(),
            host_pid: std::process::id(),
            pty,
            ring: Mutex::new(Scrollback::new(scrollback_capacity)),
            attrs: Mutex::new(Attrs { running: true, ..Attrs::default() }),
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
            read_loop_started: AtomicBool::new(false),
            output_tx,
            state_tx,
            foreground_tx,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputEvent> {
        self.output_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<()> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_foreground(&self) -> broadcast::Receiver<ForegroundProcessInfo> {
        self.foreground_tx.subscribe()
    }

    pub fn dims(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed), self.rows.load(Ordering::Relaxed))
    }

    /// Write raw input to the shell. Failures are logged and swallowed;
    /// the shell has most likely exited and state will catch up shortly.
    pub async fn send_input(&self, data: &[u8]) {
        if let Err(e) = self.pty.write_all(data).await {
            debug!(err = %e, "pty input write failed (shell exited?)");
        }
    }

    /// Resize the terminal. No-op when dimensions are unchanged.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        if !(MIN_DIM..=MAX_DIM).contains(&cols) || !(MIN_DIM..=MAX_DIM).contains(&rows) {
            anyhow::bail!("dimensions {cols}x{rows} outside {MIN_DIM}..{MAX_DIM}");
        }
        if self.dims() == (cols, rows) {
            return Ok(());
        }
        self.pty.resize(cols, rows)?;
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        self.state_changed();
        Ok(())
    }

    /// Set or clear the user-visible name.
    ///
    /// A manual call pins the name against shell-title auto-updates; a
    /// non-manual call is ignored once the name has been pinned.
    pub fn set_name(&self, name: Option<String>, manual: bool) {
        {
            let mut attrs = self.attrs.lock();
            if !manual && attrs.manually_named {
                return;
            }
            attrs.name = name;
            if manual {
                attrs.manually_named = true;
            }
        }
        self.state_changed();
    }

    pub fn set_order(&self, order: u8) {
        self.attrs.lock().order = order;
        self.state_changed();
    }

    fn set_terminal_title(&self, title: String) {
        {
            let mut attrs = self.attrs.lock();
            if attrs.terminal_title.as_deref() == Some(title.as_str()) {
                return;
            }
            attrs.terminal_title = Some(title);
        }
        self.state_changed();
    }

    /// Record a foreground-process observation from the monitor.
    pub fn set_foreground(&self, cwd: Option<String>, fg: Option<ForegroundProcessInfo>) {
        let changed = {
            let mut attrs = self.attrs.lock();
            let changed =
                attrs.foreground != fg || attrs.current_working_directory != cwd;
            attrs.current_working_directory = cwd;
            attrs.foreground = fg.clone();
            changed
        };
        if changed {
            if let Some(fg) = fg {
                let _ = self.foreground_tx.send(fg);
            }
            self.state_changed();
        }
    }

    /// Copy the current scrollback tail.
    pub fn buffer_snapshot(&self) -> Bytes {
        self.snapshot_with_cursor().0
    }

    /// Snapshot plus the cursor it corresponds to, taken under one lock.
    pub fn snapshot_with_cursor(&self) -> (Bytes, u64) {
        let ring = self.ring.lock();
        let mut buf = vec![0u8; ring.count()];
        let n = ring.snapshot_into(&mut buf);
        // n is never negative: buf was sized under the same lock.
        buf.truncate(n.max(0) as usize);
        (Bytes::from(buf), ring.total_written())
    }

    /// Scrollback cursor for handshake replay bookkeeping.
    pub fn output_cursor(&self) -> u64 {
        self.ring.lock().total_written()
    }

    /// Bytes written after `cursor`, or `None` if they have been overwritten.
    pub fn replay_since(&self, cursor: u64) -> Option<Bytes> {
        let ring = self.ring.lock();
        let available = ring.total_written().checked_sub(cursor)?;
        let mut buf = vec![0u8; available as usize];
        let (copied, ok) = ring.try_copy_since(cursor, &mut buf);
        if !ok {
            return None;
        }
        buf.truncate(copied);
        Some(Bytes::from(buf))
    }

    /// Spawn the PTY read loop. Idempotent; the loop runs until PTY EOF.
    pub fn start_read_loop(self: &Arc<Self>) {
        if self.read_loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            sup.read_loop().await;
        });
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; READ_BUF_LEN];
        let mut titles = TitleScanner::new();

        loop {
            match self.pty.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    // Append under the ring lock, then fan out. Single
                    // writer, so cursor order matches emission order.
                    let cursor = {
                        let mut ring = self.ring.lock();
                        ring.write(chunk);
                        ring.total_written()
                    };
                    if let Some(title) = titles.feed(chunk) {
                        self.set_terminal_title(title);
                    }
                    let (cols, rows) = self.dims();
                    let _ = self.output_tx.send(OutputEvent {
                        cols,
                        rows,
                        cursor,
                        data: Bytes::copy_from_slice(chunk),
                    });
                }
                // EIO from the master means the slave side is gone.
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                Err(e) => {
                    warn!(err = %e, "pty read failed");
                    break;
                }
            }
        }

        let code = self.pty.wait().await;
        {
            let mut attrs = self.attrs.lock();
            attrs.running = false;
            attrs.exit_code = code;
        }
        debug!(session = %self.session_id, exit_code = ?code, "pty read loop finished");
        self.state_changed();
    }

    /// Terminate the shell's process group.
    pub async fn kill(&self) {
        self.pty.kill().await;
    }

    pub fn is_running(&self) -> bool {
        self.attrs.lock().running
    }

    pub fn monitor_fd(&self) -> Option<std::os::fd::RawFd> {
        self.pty.monitor_fd()
    }

    /// Assemble the current session snapshot.
    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self.dims();
        let scrollback_capacity = self.ring.lock().capacity();
        let attrs = self.attrs.lock();
        SessionInfo {
            id: self.session_id.clone(),
            pid: self.pty.pid(),
            host_pid: self.host_pid,
            host_version: env!("CARGO_PKG_VERSION").to_owned(),
            shell_type: self.shell,
            cols,
            rows,
            created_at: self.created_at,
            is_running: attrs.running,
            exit_code: attrs.exit_code,
            name: attrs.name.clone(),
            terminal_title: attrs.terminal_title.clone(),
            manually_named: attrs.manually_named,
            order: attrs.order,
            current_working_directory: attrs.current_working_directory.clone(),
            foreground: attrs.foreground.clone(),
            scrollback_capacity,
        }
    }

    fn state_changed(&self) {
        let _ = self.state_tx.send(());
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
