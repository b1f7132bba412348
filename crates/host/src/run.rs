// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level host runner: PTY, supervisor, monitor, IPC server, signals.

use std::sync::Arc;

use anyhow::Context;
use nix::sys::signal::{SigHandler, Signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::monitor;
use crate::pty::spawn::NativePty;
use crate::pty::PtyConnection;
use crate::server::{IpcServer, LogLevelSetter};
use crate::supervisor::PtySupervisor;

/// Run the host process until a Close request or a termination signal.
pub async fn run(config: HostConfig, log_level: Option<LogLevelSetter>) -> anyhow::Result<i32> {
    ignore_sigpipe();

    let session = match config.session.clone() {
        Some(s) => s,
        None => anyhow::bail!("--session is required"),
    };
    let shell = config.shell_type()?;

    let pty = NativePty::spawn(shell, config.cwd.as_deref(), config.cols, config.rows)
        .context("pty spawn failed")?;
    info!(session, shell = shell.as_str(), pid = pty.pid(), "session started");

    let supervisor = PtySupervisor::new(
        session,
        shell,
        Box::new(pty),
        config.scrollback_capacity(),
        config.cols,
        config.rows,
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(&shutdown)?;
    monitor::spawn(Arc::clone(&supervisor), shutdown.clone());

    let server = IpcServer::new(Arc::clone(&supervisor), shutdown.clone(), log_level);
    server.run().await?;

    // Shutdown: a signal is equivalent to Close, so make sure the shell is
    // gone either way before the process exits.
    if supervisor.is_running() {
        debug!("killing shell on shutdown");
        supervisor.kill().await;
    }
    info!("host exiting");
    Ok(0)
}

/// SIGTERM, SIGINT, and SIGHUP all mean "shut the session down".
fn spawn_signal_handlers(shutdown: &CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::terminate(), SignalKind::interrupt(), SignalKind::hangup()] {
        let mut stream = signal(kind).context("installing signal handler failed")?;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            stream.recv().await;
            shutdown.cancel();
        });
    }
    Ok(())
}

// Installing SIG_IGN requires the unsafe nix signal call
#[allow(unsafe_code)]
fn ignore_sigpipe() {
    // SAFETY: SIG_IGN for SIGPIPE is process-global and installed before
    // any I/O; a client dropping mid-write must not kill the host.
    let _ = unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) };
}
