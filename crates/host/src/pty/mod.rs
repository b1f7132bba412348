// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod exec;
pub mod spawn;

use std::io;
use std::os::fd::RawFd;

use futures_util::future::BoxFuture;

/// Black-box PTY contract the supervisor drives.
///
/// Object-safe so the supervisor can be exercised with a scripted fake in
/// tests; the production implementation is [`spawn::NativePty`].
pub trait PtyConnection: Send + Sync + 'static {
    /// Read a chunk of shell output. `Ok(0)` means the PTY reached EOF.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;

    /// Write bytes to the shell's input.
    fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    /// Update the kernel window size (delivers SIGWINCH to the shell).
    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()>;

    /// OS pid of the shell.
    fn pid(&self) -> u32;

    fn is_running(&self) -> bool;

    /// Exit code, once known. `None` while the shell runs.
    fn exit_code(&self) -> Option<i32>;

    /// Wait for the shell to exit and return its exit code.
    fn wait<'a>(&'a self) -> BoxFuture<'a, Option<i32>>;

    /// Terminate the shell's process group: SIGHUP, short grace, SIGKILL.
    fn kill<'a>(&'a self) -> BoxFuture<'a, ()>;

    /// Raw master fd for foreground-group inspection, if the backend has one.
    fn monitor_fd(&self) -> Option<RawFd> {
        None
    }
}
