// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Mux connection manager: per-browser output queues, slow-consumer
//! detection, and the resync protocol.
//!
//! Frames are never dropped on the way in; a client that falls behind is
//! flagged and later resynced from the authoritative server-held
//! scrollback, which is cheaper than flooding it with frames its terminal
//! would overwrite anyway.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::manager::{SessionManager, SessionOutput};
use crate::mux_codec::output_frames;

/// Queue depth that alone marks a client as needing resync.
pub const HARD_QUEUE_LIMIT: usize = 100;

/// Queue depth that marks a client when combined with [`SOFT_QUEUE_AGE`].
pub const SOFT_QUEUE_LIMIT: usize = 20;

/// Age of the oldest queued frame for the soft limit.
pub const SOFT_QUEUE_AGE: Duration = Duration::from_secs(5);

/// The WebSocket receive loop wakes at least this often to check flags.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Queues {
    /// Normal outbound FIFO drained by the pump task.
    primary: VecDeque<Bytes>,
    /// Frames arriving during a resync; flushed after the snapshot.
    pending: VecDeque<Bytes>,
    /// When `primary` last became non-empty.
    started_at: Option<Instant>,
    resyncing: bool,
}

/// One attached browser socket.
pub struct MuxClient {
    /// Random 32-hex id, announced in the Init frame.
    pub id: String,
    queues: Mutex<Queues>,
    needs_resync: AtomicBool,
    /// Bumped when a resync begins; frames popped under an older epoch
    /// are stale and must not be sent.
    epoch: AtomicU64,
    notify: Notify,
}

impl MuxClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            queues: Mutex::new(Queues::default()),
            needs_resync: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Enqueue an outbound frame. Never blocks and never drops; overload
    /// only flips the resync flag.
    pub fn queue_output(&self, frame: Bytes) {
        {
            let mut q = self.queues.lock();
            if q.resyncing {
                q.pending.push_back(frame);
            } else {
                if q.primary.is_empty() {
                    q.started_at = Some(Instant::now());
                }
                q.primary.push_back(frame);
                self.check_thresholds(&q);
            }
        }
        self.notify.notify_one();
    }

    /// Re-check the overload thresholds. The receive loop calls this on
    /// its periodic timeout so a stalled queue is noticed even when no
    /// new frames arrive to trip the check in [`Self::queue_output`].
    pub fn evaluate_backpressure(&self) {
        let q = self.queues.lock();
        if !q.resyncing {
            self.check_thresholds(&q);
        }
    }

    fn check_thresholds(&self, q: &Queues) {
        let depth = q.primary.len();
        let age = q.started_at.map(|t| t.elapsed()).unwrap_or_default();
        if depth >= HARD_QUEUE_LIMIT || (depth >= SOFT_QUEUE_LIMIT && age > SOFT_QUEUE_AGE) {
            self.needs_resync.store(true, Ordering::SeqCst);
        }
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.queues.lock().primary.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Wait until frames may be available.
    pub async fn wait_output(&self) {
        self.notify.notified().await;
    }

    /// Pop the next frame together with the epoch it belongs to.
    pub fn pop_primary(&self) -> Option<(Bytes, u64)> {
        let mut q = self.queues.lock();
        if q.resyncing {
            return None;
        }
        let frame = q.primary.pop_front()?;
        if q.primary.is_empty() {
            q.started_at = None;
        }
        Some((frame, self.epoch.load(Ordering::SeqCst)))
    }

    /// Enter resync: stale queued frames are discarded (the snapshot is
    /// authoritative) and new output is diverted to the pending queue.
    pub fn begin_resync(&self) -> usize {
        let mut q = self.queues.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let discarded = q.primary.len();
        q.primary.clear();
        q.started_at = None;
        q.resyncing = true;
        discarded
    }

    /// Take a batch of post-snapshot frames, or finish the resync.
    ///
    /// Returns `None` once the pending queue is empty; the resync flags
    /// are cleared in the same critical section, so no frame can slip
    /// between "pending drained" and "back to normal".
    pub fn take_pending(&self) -> Option<Vec<Bytes>> {
        let mut q = self.queues.lock();
        if q.pending.is_empty() {
            q.resyncing = false;
            self.needs_resync.store(false, Ordering::SeqCst);
            return None;
        }
        Some(q.pending.drain(..).collect())
    }
}

/// Registry of attached browser sockets.
pub struct MuxManager {
    clients: RwLock<HashMap<String, Arc<MuxClient>>>,
}

impl MuxManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { clients: RwLock::new(HashMap::new()) })
    }

    pub async fn register(&self, client: Arc<MuxClient>) {
        self.clients.write().await.insert(client.id.clone(), client);
    }

    pub async fn remove(&self, id: &str) {
        self.clients.write().await.remove(id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn fan_out(&self, frames: &[Bytes]) {
        let clients = self.clients.read().await;
        for client in clients.values() {
            for frame in frames {
                client.queue_output(frame.clone());
            }
        }
    }
}

/// Bridge the session manager's output fanout into every mux client.
pub fn spawn_fanout(
    mux: Arc<MuxManager>,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) {
    let mut output_rx = manager.subscribe_output();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = output_rx.recv() => event,
                _ = shutdown.cancelled() => return,
            };
            match event {
                Ok(SessionOutput { session_id, cols, rows, data }) => {
                    match output_frames(&session_id, cols, rows, &data) {
                        Ok(frames) => mux.fan_out(&frames).await,
                        Err(e) => warn!(session = %session_id, err = %e, "output frame failed"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Affected browsers will cross a resync threshold and
                    // recover from scrollback.
                    debug!(missed, "mux fanout lagged behind session output");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

#[cfg(test)]
#[path = "mux_tests.rs"]
mod tests;
