// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

/// Shells a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    Bash,
    Zsh,
    Fish,
    Sh,
    Pwsh,
}

impl ShellType {
    /// Parse a shell name as it appears on the CLI or in a create request.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "bash" => Some(Self::Bash),
            "zsh" => Some(Self::Zsh),
            "fish" => Some(Self::Fish),
            "sh" => Some(Self::Sh),
            "pwsh" | "powershell" => Some(Self::Pwsh),
            _ => None,
        }
    }

    /// Program name to exec.
    pub fn program(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Fish => "fish",
            Self::Sh => "sh",
            Self::Pwsh => "pwsh",
        }
    }

    /// Default arguments for an interactive session.
    pub fn default_args(&self) -> &'static [&'static str] {
        match self {
            Self::Bash | Self::Zsh => &["-il"],
            Self::Fish | Self::Sh => &["-i"],
            Self::Pwsh => &["-NoLogo"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.program()
    }
}

impl Default for ShellType {
    fn default() -> Self {
        Self::Bash
    }
}

/// Foreground process detail reported by the process monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundProcessInfo {
    pub pid: i32,
    pub name: String,
    pub command_line: String,
}

/// Everything the gateway (and ultimately the browser) knows about a session.
///
/// Serialized as the `Info` IPC payload and returned verbatim from the
/// gateway session list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Eight-hex session id, process-local unique.
    pub id: String,
    /// OS pid of the shell.
    pub pid: u32,
    /// OS pid of the supervising host process.
    pub host_pid: u32,
    /// Version of the host binary, for gateway compatibility checks.
    pub host_version: String,
    pub shell_type: ShellType,
    pub cols: u16,
    pub rows: u16,
    /// Epoch milliseconds at session creation.
    pub created_at: u64,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// User-assigned name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Title the shell reported via an OSC escape, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_title: Option<String>,
    /// Once set, shell-title updates must not overwrite `name`.
    #[serde(default)]
    pub manually_named: bool,
    /// Sort key for session lists.
    #[serde(default)]
    pub order: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<ForegroundProcessInfo>,
    /// Scrollback capacity in bytes.
    pub scrollback_capacity: usize,
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
