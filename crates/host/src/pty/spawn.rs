// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Native PTY backend: `openpty` plus a self-exec helper child.
//!
//! The shell is not spawned directly. We open the PTY pair here, then
//! re-invoke our own binary with `--pty-exec <slave> <shell> [args...]`;
//! the helper becomes a session leader, claims the slave as its controlling
//! terminal, and execs the shell. That keeps all post-fork setup out of the
//! async runtime's worker threads.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::future::BoxFuture;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{ttyname, Pid};
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};

use super::PtyConnection;
use crate::session_info::ShellType;

/// Newtype wrapper around `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
struct PtyFd(OwnedFd);

impl AsRawFd for PtyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for PtyFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 }
}

/// PTY backend supervising one shell child.
pub struct NativePty {
    master: AsyncFd<PtyFd>,
    child_pid: Pid,
    child: tokio::sync::Mutex<Child>,
    exit: OnceLock<Option<i32>>,
}

impl NativePty {
    /// Open a PTY pair and spawn the shell on its slave side.
    pub fn spawn(
        shell: ShellType,
        cwd: Option<&Path>,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<Self> {
        let ws = winsize(cols, rows);
        let pty = openpty(&ws, None).context("openpty failed")?;

        // The helper child reopens the slave by path; our copy must be
        // closed so master reads see EOF when the shell exits.
        let slave_path = ttyname(&pty.slave).context("ttyname on pty slave failed")?;
        drop(pty.slave);

        let exe = std::env::current_exe().context("current_exe failed")?;
        let mut cmd = Command::new(exe);
        cmd.arg("--pty-exec").arg(&slave_path).arg(shell.program());
        cmd.args(shell.default_args());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        let child = cmd.spawn().context("spawning pty exec helper failed")?;
        let child_pid = match child.id() {
            Some(pid) => Pid::from_raw(pid as i32),
            None => bail!("pty exec helper exited before its pid could be read"),
        };

        set_nonblocking(&pty.master)?;
        let master = AsyncFd::new(PtyFd(pty.master)).context("AsyncFd::new failed")?;

        Ok(Self { master, child_pid, child: tokio::sync::Mutex::new(child), exit: OnceLock::new() })
    }
}

impl PtyConnection for NativePty {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            loop {
                let mut guard = self.master.readable().await?;
                match guard.try_io(|inner| {
                    let n = nix::unistd::read(inner, buf).map_err(io_err)?;
                    Ok(n)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        })
    }

    fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut offset = 0;
            while offset < data.len() {
                let mut guard = self.master.writable().await?;
                match guard.try_io(|inner| {
                    let n = nix::unistd::write(inner, &data[offset..]).map_err(io_err)?;
                    Ok(n)
                }) {
                    Ok(Ok(n)) => offset += n,
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => continue,
                }
            }
            Ok(())
        })
    }

    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = winsize(cols, rows);
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd. The Winsize struct is properly
        // initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    fn is_running(&self) -> bool {
        self.exit.get().is_none()
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit.get().copied().flatten()
    }

    fn wait<'a>(&'a self) -> BoxFuture<'a, Option<i32>> {
        Box::pin(async move {
            if let Some(code) = self.exit.get() {
                return *code;
            }
            let mut child = self.child.lock().await;
            let code = match child.wait().await {
                Ok(status) => Some(exit_code_of(status)),
                Err(_) => None,
            };
            let _ = self.exit.set(code);
            code
        })
    }

    fn kill<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            // Signal the process group: the helper setsids, so the shell's
            // group id equals its pid and grandchildren are included.
            let group = Pid::from_raw(-self.child_pid.as_raw());
            let _ = kill(group, Signal::SIGHUP);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.is_running() {
                let _ = kill(group, Signal::SIGKILL);
            }
        })
    }

    fn monitor_fd(&self) -> Option<RawFd> {
        Some(self.master.as_raw_fd())
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if self.exit.get().is_none() {
            // Best-effort teardown: SIGHUP then SIGKILL.
            let group = Pid::from_raw(-self.child_pid.as_raw());
            let _ = kill(group, Signal::SIGHUP);
            let _ = kill(group, Signal::SIGKILL);
        }
    }
}

/// Convert a tokio exit status into the single exit-code byte stream
/// convention: normal codes pass through, signal deaths become 128+N.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Set the given file descriptor to non-blocking mode.
#[allow(unsafe_code)]
fn set_nonblocking(fd: &impl AsRawFd) -> anyhow::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid, open fd for the lifetime of this borrow.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw) };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL).map_err(io_err).context("F_GETFL failed")?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(borrowed, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .map_err(io_err)
        .context("F_SETFL failed")?;
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
