// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mthost::config::HostConfig;
use mthost::server::LogLevelSetter;

fn main() {
    let config = HostConfig::parse();

    // The exec helper must run before the async runtime spins up worker
    // threads; on success it never returns.
    if let Some(args) = config.pty_exec.clone() {
        let err = mthost::pty::exec::replace_with_shell(&args);
        eprintln!("pty-exec: {err:#}");
        std::process::exit(1);
    }

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    let (filter, reload_handle) =
        tracing_subscriber::reload::Layer::new(EnvFilter::new(config.log_filter()));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    // SetLogLevel requests retarget the filter through this handle.
    let log_level: LogLevelSetter = Arc::new(move |level: &str| {
        let parsed = EnvFilter::try_new(level)
            .map_err(|e| anyhow::anyhow!("invalid log level {level:?}: {e}"))?;
        reload_handle.reload(parsed).map_err(|e| anyhow::anyhow!("filter reload failed: {e}"))?;
        Ok(())
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: building runtime failed: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(mthost::run::run(config, Some(log_level))) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
