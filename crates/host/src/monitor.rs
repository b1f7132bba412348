// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Foreground process monitor.
//!
//! Polls the PTY's foreground process group and surfaces its name, command
//! line, and working directory through the supervisor. Procfs reads race
//! with process exit as a matter of course, so every failure is silent;
//! the next poll gets another chance.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use nix::libc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session_info::ForegroundProcessInfo;
use crate::supervisor::PtySupervisor;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Spawn the monitor task for a supervisor. Does nothing if the PTY
/// backend has no inspectable fd.
pub fn spawn(supervisor: Arc<PtySupervisor>, shutdown: CancellationToken) {
    let Some(fd) = supervisor.monitor_fd() else {
        return;
    };
    tokio::spawn(async move {
        run(supervisor, fd, shutdown).await;
    });
}

async fn run(supervisor: Arc<PtySupervisor>, fd: RawFd, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let mut last: Option<(Option<String>, Option<ForegroundProcessInfo>)> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let Some(pgid) = foreground_group(fd) else {
            continue;
        };
        let observed = (read_cwd(pgid), read_process(pgid));
        if last.as_ref() != Some(&observed) {
            debug!(pgid, fg = ?observed.1.as_ref().map(|f| f.name.as_str()), "foreground changed");
            supervisor.set_foreground(observed.0.clone(), observed.1.clone());
            last = Some(observed);
        }
    }
}

// tcgetpgrp requires unsafe for the raw libc call
#[allow(unsafe_code)]
fn foreground_group(fd: RawFd) -> Option<i32> {
    // SAFETY: tcgetpgrp only inspects the fd; an invalid or hung-up fd
    // yields -1, which we treat as "nothing to report".
    let pgid = unsafe { libc::tcgetpgrp(fd) };
    (pgid > 0).then_some(pgid)
}

fn read_process(pid: i32) -> Option<ForegroundProcessInfo> {
    let name = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let command_line = cmdline
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    Some(ForegroundProcessInfo { pid, name: name.trim_end().to_owned(), command_line })
}

fn read_cwd(pid: i32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/cwd"))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}
