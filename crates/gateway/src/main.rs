// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use mtgate::config::{hash_password, GatewayConfig};

#[tokio::main]
async fn main() {
    let config = GatewayConfig::parse();

    if let Some(password) = &config.hash_password {
        println!("{}", hash_password(password));
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.loglevel.clone())),
        )
        .init();

    if let Err(e) = mtgate::run(config).await {
        error!("fatal: {e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
