// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::scrollback::{clamp_capacity, DEFAULT_CAPACITY};
use crate::session_info::ShellType;
use crate::supervisor::{MAX_DIM, MIN_DIM};

/// Per-session PTY host for the web terminal gateway.
#[derive(Debug, Parser)]
#[command(name = "mthost", version, about)]
pub struct HostConfig {
    /// Eight-hex session id assigned by the gateway.
    #[arg(long, env = "MTHOST_SESSION")]
    pub session: Option<String>,

    /// Shell to run (bash, zsh, fish, sh, pwsh).
    #[arg(long, default_value = "bash", env = "MTHOST_SHELL")]
    pub shell: String,

    /// Working directory for the shell.
    #[arg(long, env = "MTHOST_CWD")]
    pub cwd: Option<PathBuf>,

    /// Terminal columns.
    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    /// Terminal rows.
    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    /// Scrollback capacity in bytes, clamped to [64 KiB, 64 MiB].
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub scrollback: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MTHOST_LOG_LEVEL")]
    pub loglevel: String,

    /// Shorthand for --loglevel debug.
    #[arg(long)]
    pub debug: bool,

    /// Internal exec helper: become the shell on the given PTY slave.
    /// Never returns.
    #[arg(
        long,
        value_names = ["SLAVE", "SHELL"],
        num_args = 2..,
        allow_hyphen_values = true,
        hide = true
    )]
    pub pty_exec: Option<Vec<String>>,
}

impl HostConfig {
    /// Validate the configuration after parsing. The exec helper bypasses
    /// all session options.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pty_exec.is_some() {
            return Ok(());
        }

        let session = match &self.session {
            Some(s) => s,
            None => anyhow::bail!("--session is required"),
        };
        if session.len() != 8 || !session.bytes().all(|b| b.is_ascii_hexdigit()) {
            anyhow::bail!("session id must be exactly 8 hex characters");
        }

        self.shell_type()?;

        for (what, value) in [("cols", self.cols), ("rows", self.rows)] {
            if !(MIN_DIM..=MAX_DIM).contains(&value) {
                anyhow::bail!("--{what} must be in {MIN_DIM}..{MAX_DIM}");
            }
        }

        Ok(())
    }

    pub fn shell_type(&self) -> anyhow::Result<ShellType> {
        ShellType::from_name(&self.shell)
            .ok_or_else(|| anyhow::anyhow!("unknown shell type: {}", self.shell))
    }

    pub fn scrollback_capacity(&self) -> usize {
        clamp_capacity(self.scrollback)
    }

    /// Initial tracing filter directive.
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.loglevel
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
