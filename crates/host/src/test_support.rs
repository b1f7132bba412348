// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted PTY backend for unit and integration tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::pty::PtyConnection;
use crate::session_info::ShellType;
use crate::supervisor::PtySupervisor;

/// Fake PTY: output chunks are pushed through a channel, input writes are
/// recorded, EOF arrives when the [`FakePtyHandle`] is dropped.
pub struct FakePty {
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    pub written: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub fail_writes: AtomicBool,
    exit_code: Option<i32>,
}

/// Test-side controller for a [`FakePty`].
pub struct FakePtyHandle {
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl FakePtyHandle {
    /// Queue a chunk of shell output.
    pub fn emit(&self, chunk: &[u8]) {
        let _ = self.output_tx.send(chunk.to_vec());
    }
}

/// Build a fake PTY reporting `exit_code` once its handle is dropped.
pub fn fake_pty(exit_code: Option<i32>) -> (Arc<FakePty>, FakePtyHandle) {
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let pty = Arc::new(FakePty {
        output_rx: tokio::sync::Mutex::new(output_rx),
        written: Mutex::new(Vec::new()),
        resizes: Mutex::new(Vec::new()),
        fail_writes: AtomicBool::new(false),
        exit_code,
    });
    (pty, FakePtyHandle { output_tx })
}

/// Supervisor over a fake PTY with an 80x24 terminal and a small ring.
pub fn fake_supervisor(session_id: &str, pty: Arc<FakePty>) -> Arc<PtySupervisor> {
    PtySupervisor::new(session_id.to_owned(), ShellType::Bash, Box::new(pty), 4096, 80, 24)
}

impl PtyConnection for Arc<FakePty> {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut rx = self.output_rx.lock().await;
            match rx.recv().await {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        })
    }

    fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.written.lock().extend_from_slice(data);
            Ok(())
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.resizes.lock().push((cols, rows));
        Ok(())
    }

    fn pid(&self) -> u32 {
        4242
    }

    fn is_running(&self) -> bool {
        true
    }

    fn exit_code(&self) -> Option<i32> {
        None
    }

    fn wait<'a>(&'a self) -> BoxFuture<'a, Option<i32>> {
        Box::pin(async move { self.exit_code })
    }

    fn kill<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {})
    }
}
