// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager: spawn, discover, and track terminal sessions.
//!
//! In service mode every session lives in its own `mthost` process behind
//! a [`HostClient`]; in direct mode the supervisor runs in-process. Both
//! back the same operations, so the HTTP and mux layers never care which
//! mode is active.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mthost::ipc::endpoint_path;
use mthost::pty::spawn::NativePty;
use mthost::scrollback::DEFAULT_CAPACITY;
use mthost::session_info::{SessionInfo, ShellType};
use mthost::supervisor::{PtySupervisor, MAX_DIM, MIN_DIM};

use crate::discovery::{self, Endpoint};
use crate::hostclient::{HostClient, HostEvent, CONNECT_TIMEOUT};

/// Spawn-then-connect poll budget: 10 tries, 200 ms apart.
const SPAWN_CONNECT_TRIES: u32 = 10;
const SPAWN_CONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// Per-connect timeout inside the poll loop.
const SPAWN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// One chunk of session output, fanned out to the mux plane.
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    pub data: Bytes,
}

enum SessionHandle {
    Remote { client: Arc<HostClient> },
    Local { supervisor: Arc<PtySupervisor> },
}

struct SessionEntry {
    handle: SessionHandle,
    /// Scope of the per-session event forwarding tasks.
    cancel: CancellationToken,
}

pub struct SessionManager {
    service_mode: bool,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    /// Last-known SessionInfo per session; survives host hiccups so the
    /// session list stays meaningful while a host is unreachable.
    infos: RwLock<HashMap<String, SessionInfo>>,
    drop_dirs: parking_lot::Mutex<HashMap<String, PathBuf>>,
    output_tx: broadcast::Sender<SessionOutput>,
    state_tx: broadcast::Sender<String>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(service_mode: bool, shutdown: CancellationToken) -> Arc<Self> {
        let (output_tx, _) = broadcast::channel(4096);
        let (state_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            service_mode,
            sessions: RwLock::new(HashMap::new()),
            infos: RwLock::new(HashMap::new()),
            drop_dirs: parking_lot::Mutex::new(HashMap::new()),
            output_tx,
            state_tx,
            shutdown,
        })
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<SessionOutput> {
        self.output_tx.subscribe()
    }

    /// Session ids whose cached info changed.
    pub fn subscribe_state(&self) -> broadcast::Receiver<String> {
        self.state_tx.subscribe()
    }

    /// Cached infos, sorted by `(order, created_at)` so order collisions
    /// fall back to creation order.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.infos.read().await.values().cloned().collect();
        infos.sort_by_key(|info| (info.order, info.created_at));
        infos
    }

    pub async fn info(&self, id: &str) -> Option<SessionInfo> {
        self.infos.read().await.get(id).cloned()
    }

    /// Reconnect to every compatible host that survived a gateway restart.
    pub async fn discover_existing(self: &Arc<Self>) {
        if !self.service_mode {
            return;
        }
        let survivors =
            discovery::discover(&std::env::temp_dir(), discovery::scan_host_processes()).await;
        for (endpoint, _probe_info) in survivors {
            if let Err(e) = self.adopt(&endpoint).await {
                warn!(
                    session = %endpoint.session_id,
                    err = format!("{e:#}"),
                    "adopting surviving host failed"
                );
            }
        }
    }

    /// Register a discovered host by establishing the real client
    /// connection (the probe connection is superseded by it).
    async fn adopt(self: &Arc<Self>, endpoint: &Endpoint) -> anyhow::Result<()> {
        let (client, info) = HostClient::connect(endpoint.path.clone(), CONNECT_TIMEOUT).await?;
        self.register_remote(info, client).await;
        Ok(())
    }

    /// Create a new session and return its initial info.
    pub async fn create(
        self: &Arc<Self>,
        shell: ShellType,
        cwd: Option<PathBuf>,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<SessionInfo> {
        validate_dims(cols, rows)?;
        let id = new_session_id();

        let info = if self.service_mode {
            self.spawn_host(&id, shell, cwd, cols, rows).await?
        } else {
            self.spawn_local(&id, shell, cwd, cols, rows).await?
        };

        info!(session = %id, shell = shell.as_str(), pid = info.pid, "session created");
        let _ = self.state_tx.send(id);
        Ok(info)
    }

    /// Service mode: spawn `mthost` and poll-connect to its endpoint.
    /// Every failure path kills the spawned process: a host with no
    /// gateway holds a PTY forever.
    async fn spawn_host(
        self: &Arc<Self>,
        id: &str,
        shell: ShellType,
        cwd: Option<PathBuf>,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<SessionInfo> {
        let mut cmd = tokio::process::Command::new(host_binary());
        cmd.arg("--session")
            .arg(id)
            .arg("--shell")
            .arg(shell.as_str())
            .arg("--cols")
            .arg(cols.to_string())
            .arg("--rows")
            .arg(rows.to_string());
        if let Some(dir) = &cwd {
            cmd.arg("--cwd").arg(dir);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().context("spawning mthost failed")?;
        let host_pid = match child.id() {
            Some(pid) => pid,
            None => anyhow::bail!("mthost exited before its pid could be read"),
        };
        let path = endpoint_path(id, host_pid);

        let mut last_err: Option<anyhow::Error> = None;
        for _ in 0..SPAWN_CONNECT_TRIES {
            tokio::time::sleep(SPAWN_CONNECT_INTERVAL).await;
            match HostClient::connect_once(path.clone(), SPAWN_CONNECT_TIMEOUT).await {
                Ok((client, info)) => {
                    self.register_remote(info.clone(), client).await;
                    return Ok(info);
                }
                Err(e) => last_err = Some(e),
            }
        }

        warn!(session = %id, host_pid, "host never became reachable, killing spawn");
        let _ = child.start_kill();
        let _ = child.wait().await;
        let _ = std::fs::remove_file(&path);
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("host connect failed"))
            .context("session spawn failed"))
    }

    /// Direct mode: run the supervisor in-process.
    async fn spawn_local(
        self: &Arc<Self>,
        id: &str,
        shell: ShellType,
        cwd: Option<PathBuf>,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<SessionInfo> {
        let pty = NativePty::spawn(shell, cwd.as_deref(), cols, rows).context("pty spawn failed")?;
        let supervisor = PtySupervisor::new(
            id.to_owned(),
            shell,
            Box::new(pty),
            DEFAULT_CAPACITY,
            cols,
            rows,
        );
        // No IPC handshake gates delivery here; start reading immediately.
        supervisor.start_read_loop();

        let cancel = self.shutdown.child_token();
        mthost::monitor::spawn(Arc::clone(&supervisor), cancel.clone());

        let info = supervisor.info();
        let manager = Arc::clone(self);
        let sup = Arc::clone(&supervisor);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            manager.forward_local_events(sup, task_cancel).await;
        });

        let entry = SessionEntry { handle: SessionHandle::Local { supervisor }, cancel };
        self.insert_entry(info.clone(), entry).await;
        Ok(info)
    }

    async fn insert_entry(&self, info: SessionInfo, entry: SessionEntry) {
        let id = info.id.clone();
        self.sessions.write().await.insert(id.clone(), entry);
        self.infos.write().await.insert(id, info);
    }

    async fn register_remote(self: &Arc<Self>, info: SessionInfo, client: Arc<HostClient>) {
        let cancel = self.shutdown.child_token();
        let manager = Arc::clone(self);
        let events = client.subscribe();
        let id = info.id.clone();
        let task_cancel = cancel.clone();
        let task_client = Arc::clone(&client);
        tokio::spawn(async move {
            manager.forward_remote_events(id, task_client, events, task_cancel).await;
        });

        let entry = SessionEntry { handle: SessionHandle::Remote { client }, cancel };
        self.insert_entry(info, entry).await;
    }

    /// Pump a host client's events into the aggregate channels and keep
    /// the info cache fresh.
    async fn forward_remote_events(
        self: Arc<Self>,
        id: String,
        client: Arc<HostClient>,
        mut events: broadcast::Receiver<HostEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => return,
            };
            match event {
                Ok(HostEvent::Output { cols, rows, data }) => {
                    let _ = self.output_tx.send(SessionOutput {
                        session_id: id.clone(),
                        cols,
                        rows,
                        data,
                    });
                }
                Ok(HostEvent::State(state)) => {
                    // A StateChange also covers title/name/dimension edits
                    // made host-side, so refresh the whole record when the
                    // host is reachable. The event stays authoritative for
                    // liveness: a dead or giving-up host cannot answer
                    // GetInfo, but its exit state must stick.
                    let refreshed = client.get_info().await.ok();
                    {
                        let mut infos = self.infos.write().await;
                        if let Some(fresh) = refreshed {
                            infos.insert(id.clone(), fresh);
                        }
                        if let Some(info) = infos.get_mut(&id) {
                            info.is_running = state.is_running;
                            info.exit_code = state.exit_code;
                        }
                    }
                    let _ = self.state_tx.send(id.clone());
                }
                Ok(HostEvent::Foreground(fg)) => {
                    {
                        let mut infos = self.infos.write().await;
                        if let Some(info) = infos.get_mut(&id) {
                            info.foreground = Some(fg);
                        }
                    }
                    let _ = self.state_tx.send(id.clone());
                }
                Ok(HostEvent::Reconnected(info)) => {
                    // Reconnect-driven sync: the handshake snapshot
                    // replaces the whole cached record.
                    self.infos.write().await.insert(id.clone(), *info);
                    let _ = self.state_tx.send(id.clone());
                }
                Ok(HostEvent::Disconnected) => {
                    debug!(session = %id, "host disconnected");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(session = %id, missed, "session event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Direct-mode counterpart of [`Self::forward_remote_events`].
    async fn forward_local_events(
        self: Arc<Self>,
        supervisor: Arc<PtySupervisor>,
        cancel: CancellationToken,
    ) {
        let id = supervisor.session_id().to_owned();
        let mut output = supervisor.subscribe_output();
        let mut state = supervisor.subscribe_state();
        loop {
            tokio::select! {
                event = output.recv() => match event {
                    Ok(event) => {
                        let _ = self.output_tx.send(SessionOutput {
                            session_id: id.clone(),
                            cols: event.cols,
                            rows: event.rows,
                            data: event.data,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(session = %id, missed, "output subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                event = state.recv() => match event {
                    Ok(()) => {
                        self.infos.write().await.insert(id.clone(), supervisor.info());
                        let _ = self.state_tx.send(id.clone());
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.infos.write().await.insert(id.clone(), supervisor.info());
                        let _ = self.state_tx.send(id.clone());
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Close a session and forget it.
    pub async fn close(&self, id: &str) -> anyhow::Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(id)
            .with_context(|| format!("unknown session {id}"))?;
        entry.cancel.cancel();

        match entry.handle {
            SessionHandle::Remote { client } => {
                if let Err(e) = client.close().await {
                    // The host may already be dead; closing still succeeds
                    // from the user's point of view.
                    debug!(session = %id, err = format!("{e:#}"), "host close failed");
                }
            }
            SessionHandle::Local { supervisor } => supervisor.kill().await,
        }

        self.infos.write().await.remove(id);
        self.remove_drop_dir(id);
        info!(session = %id, "session closed");
        let _ = self.state_tx.send(id.to_owned());
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> anyhow::Result<()> {
        validate_dims(cols, rows)?;
        match &self.entry_handle(id).await? {
            HandleRef::Remote(client) => client.resize(cols, rows).await?,
            HandleRef::Local(supervisor) => supervisor.resize(cols, rows)?,
        }
        {
            let mut infos = self.infos.write().await;
            if let Some(info) = infos.get_mut(id) {
                info.cols = cols;
                info.rows = rows;
            }
        }
        let _ = self.state_tx.send(id.to_owned());
        Ok(())
    }

    pub async fn set_name(&self, id: &str, name: Option<&str>, manual: bool) -> anyhow::Result<()> {
        let refreshed = match &self.entry_handle(id).await? {
            HandleRef::Remote(client) => {
                client.set_name(name, manual).await?;
                // The host owns the manual-name gating; refresh rather
                // than second-guess it.
                client.get_info().await?
            }
            HandleRef::Local(supervisor) => {
                supervisor.set_name(name.map(str::to_owned), manual);
                supervisor.info()
            }
        };
        self.infos.write().await.insert(id.to_owned(), refreshed);
        let _ = self.state_tx.send(id.to_owned());
        Ok(())
    }

    pub async fn set_order(&self, id: &str, order: u8) -> anyhow::Result<()> {
        match &self.entry_handle(id).await? {
            HandleRef::Remote(client) => client.set_order(order).await?,
            HandleRef::Local(supervisor) => supervisor.set_order(order),
        }
        {
            let mut infos = self.infos.write().await;
            if let Some(info) = infos.get_mut(id) {
                info.order = order;
            }
        }
        let _ = self.state_tx.send(id.to_owned());
        Ok(())
    }

    /// Retarget a host's log filter at runtime. Direct-mode sessions share
    /// the gateway's own filter, so there is nothing to set per-session.
    pub async fn set_log_level(&self, id: &str, level: &str) -> anyhow::Result<()> {
        match &self.entry_handle(id).await? {
            HandleRef::Remote(client) => client.set_log_level(level).await,
            HandleRef::Local(_) => {
                anyhow::bail!("session {id} runs in-process; use the gateway log level")
            }
        }
    }

    pub async fn send_input(&self, id: &str, data: &[u8]) -> anyhow::Result<()> {
        match &self.entry_handle(id).await? {
            HandleRef::Remote(client) => client.send_input(data).await,
            HandleRef::Local(supervisor) => supervisor.send_input(data).await,
        }
        Ok(())
    }

    pub async fn buffer(&self, id: &str) -> anyhow::Result<Bytes> {
        match &self.entry_handle(id).await? {
            HandleRef::Remote(client) => client.get_buffer().await,
            HandleRef::Local(supervisor) => Ok(supervisor.buffer_snapshot()),
        }
    }

    /// Per-session temp directory for drag-and-drop uploads, created on
    /// first use.
    pub async fn drop_dir(&self, id: &str) -> anyhow::Result<PathBuf> {
        self.entry_handle(id).await?;
        let path = std::env::temp_dir().join("mm-drops").join(id);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating {} failed", path.display()))?;
        self.drop_dirs.lock().insert(id.to_owned(), path.clone());
        Ok(path)
    }

    fn remove_drop_dir(&self, id: &str) {
        if let Some(path) = self.drop_dirs.lock().remove(id) {
            // Locked or vanished files are tolerated.
            let _ = std::fs::remove_dir_all(path);
        }
    }

    async fn entry_handle(&self, id: &str) -> anyhow::Result<HandleRef> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(id).with_context(|| format!("unknown session {id}"))?;
        Ok(match &entry.handle {
            SessionHandle::Remote { client } => HandleRef::Remote(Arc::clone(client)),
            SessionHandle::Local { supervisor } => HandleRef::Local(Arc::clone(supervisor)),
        })
    }
}

/// Cloned-out handle so operations never hold the sessions map lock
/// across IPC awaits.
enum HandleRef {
    Remote(Arc<HostClient>),
    Local(Arc<PtySupervisor>),
}

fn validate_dims(cols: u16, rows: u16) -> anyhow::Result<()> {
    for (what, value) in [("cols", cols), ("rows", rows)] {
        if !(MIN_DIM..=MAX_DIM).contains(&value) {
            anyhow::bail!("{what} must be in {MIN_DIM}..{MAX_DIM}, got {value}");
        }
    }
    Ok(())
}

/// First eight hex chars of a random UUID.
fn new_session_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..8].to_owned()
}

/// The mthost binary next to our own executable, falling back to $PATH.
fn host_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("mthost");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("mthost")
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
