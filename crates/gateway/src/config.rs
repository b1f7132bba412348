// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use sha2::{Digest, Sha256};

/// Browser-facing terminal gateway.
#[derive(Debug, Clone, Parser)]
#[command(name = "mtgate", version, about)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[arg(long, default_value_t = 2000, env = "MTGATE_PORT")]
    pub port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0", env = "MTGATE_BIND")]
    pub bind: String,

    /// Run each terminal in its own host process that survives gateway
    /// restarts. Without this, terminals live in the gateway itself.
    #[arg(long, visible_alias = "spawned", env = "MTGATE_SERVICE")]
    pub service: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MTGATE_LOG_LEVEL")]
    pub loglevel: String,

    /// Print the SHA-256 hash of a password and exit.
    #[arg(long, value_name = "PASSWORD")]
    pub hash_password: Option<String>,
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Hex SHA-256, as stored in the gateway's auth settings.
pub fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
