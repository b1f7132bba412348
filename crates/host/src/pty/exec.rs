// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-side half of PTY spawning.
//!
//! `mthost --pty-exec <slave> <shell> [args...]` lands here before the
//! tokio runtime exists. The process becomes a session leader, claims the
//! slave as its controlling terminal, wires it to stdio, and execs the
//! shell. It never returns on success.

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};

use anyhow::{anyhow, bail, Context};
use nix::libc;
use nix::unistd::{execvp, setsid};

/// Replace this process with the shell. Returns only on failure.
pub fn replace_with_shell(args: &[String]) -> anyhow::Error {
    match try_exec(args) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

fn try_exec(args: &[String]) -> anyhow::Result<std::convert::Infallible> {
    let (slave_path, shell_args) = match args {
        [slave, rest @ ..] if !rest.is_empty() => (slave, rest),
        _ => bail!("--pty-exec needs a slave path and a shell command"),
    };

    setsid().context("setsid failed")?;

    let slave = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(slave_path)
        .with_context(|| format!("open pty slave {slave_path} failed"))?;

    claim_tty(slave.as_raw_fd())?;

    let c_args: Vec<CString> = shell_args
        .iter()
        .map(|s| CString::new(s.as_bytes()))
        .collect::<Result<_, _>>()
        .context("invalid shell argument")?;

    match execvp(&c_args[0], &c_args) {
        Ok(never) => match never {},
        Err(e) => Err(anyhow!("execvp {:?} failed: {e}", shell_args[0])),
    }
}

// TIOCSCTTY and dup2 require unsafe for the raw libc calls
#[allow(unsafe_code)]
fn claim_tty(fd: RawFd) -> anyhow::Result<()> {
    // SAFETY: the fd was just opened and stays open until exec; the process
    // is single-threaded at this point. TIOCSCTTY attaches the tty to the
    // fresh session, dup2 wires it to stdio.
    unsafe {
        if libc::ioctl(fd, libc::TIOCSCTTY, 0) < 0 {
            bail!("TIOCSCTTY failed: {}", std::io::Error::last_os_error());
        }
        for target in 0..=2 {
            if libc::dup2(fd, target) < 0 {
                bail!("dup2({fd}, {target}) failed: {}", std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}
