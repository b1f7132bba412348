// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup discovery of surviving host processes.
//!
//! Hosts outlive gateway restarts on purpose. At startup the gateway
//! enumerates host endpoints and processes, reconnects to every healthy
//! compatible host, and reaps everything else: version-incompatible and
//! unresponsive hosts are killed, stale endpoint files unlinked, and any
//! host process with no endpoint at all is an orphan holding a PTY
//! hostage, so it is killed too.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use mthost::ipc::{self, parse_endpoint_name};
use mthost::protocol::MsgType;
use mthost::session_info::SessionInfo;

/// Version the gateway expects its hosts to run.
pub const EXPECTED_HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest host protocol this gateway still speaks.
pub const MIN_COMPATIBLE_HOST_VERSION: &str = "0.5.0";

/// A host that cannot answer `GetInfo` in this window is unresponsive.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// An endpoint file and its parsed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub path: PathBuf,
    pub session_id: String,
    pub host_pid: u32,
}

/// Probe outcome for one endpoint.
#[derive(Debug)]
pub enum Probe {
    /// Healthy, version-compatible host.
    Compatible(SessionInfo),
    /// Host answered with an incompatible version.
    Incompatible(String),
    /// Connection accepted but `GetInfo` never answered.
    Unresponsive,
    /// Nothing is listening; the endpoint file is stale.
    NoListener,
}

/// Compare two `major.minor.patch` versions. Missing components count as
/// zero; non-numeric components make the comparison undecidable.
pub fn semver_compare(a: &str, b: &str) -> Option<Ordering> {
    fn triplet(v: &str) -> Option<[u64; 3]> {
        let mut out = [0u64; 3];
        let mut parts = v.split('.');
        for slot in &mut out {
            match parts.next() {
                Some(part) => *slot = part.parse().ok()?,
                None => break,
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(out)
    }
    Some(triplet(a)?.cmp(&triplet(b)?))
}

/// Exact match, or at least the minimum compatible version.
pub fn version_compatible(version: &str) -> bool {
    version == EXPECTED_HOST_VERSION
        || semver_compare(version, MIN_COMPATIBLE_HOST_VERSION)
            .is_some_and(|ord| ord != Ordering::Less)
}

/// Enumerate host endpoint files in `dir`.
pub fn scan_endpoints(dir: &Path) -> Vec<Endpoint> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut endpoints: Vec<Endpoint> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name();
            let (session_id, host_pid) = parse_endpoint_name(name.to_str()?)?;
            Some(Endpoint { path: entry.path(), session_id, host_pid })
        })
        .collect();
    endpoints.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    endpoints
}

/// Pids of every running `mthost` process.
pub fn scan_host_processes() -> HashSet<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return HashSet::new();
    };
    entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let comm = std::fs::read_to_string(entry.path().join("comm")).ok()?;
            (comm.trim_end() == "mthost").then_some(pid)
        })
        .collect()
}

/// Connect and `GetInfo` with a short deadline, classifying the endpoint.
pub async fn probe(path: &Path) -> Probe {
    let stream = match tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::net::UnixStream::connect(path),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return Probe::NoListener,
    };

    let exchange = async {
        ipc::write_frame(&stream, MsgType::GetInfo, &[]).await?;
        loop {
            let (msg, payload) = ipc::read_frame(&stream).await?;
            if msg == MsgType::Info {
                return anyhow::Ok(mthost::protocol::decode_info(&payload)?);
            }
        }
    };

    match tokio::time::timeout(PROBE_TIMEOUT, exchange).await {
        Ok(Ok(info)) if version_compatible(&info.host_version) => Probe::Compatible(info),
        Ok(Ok(info)) => Probe::Incompatible(info.host_version),
        Ok(Err(_)) | Err(_) => Probe::Unresponsive,
    }
}

pub fn kill_host(pid: u32) {
    debug!(pid, "killing host process");
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

/// Classify every discovered endpoint and reap the leftovers. Returns the
/// endpoints worth reconnecting to.
///
/// `orphans` is the set of running host pids (see [`scan_host_processes`]);
/// whatever is left in it after classification gets killed.
pub async fn discover(dir: &Path, mut orphans: HashSet<u32>) -> Vec<(Endpoint, SessionInfo)> {
    let mut survivors = Vec::new();

    for endpoint in scan_endpoints(dir) {
        match probe(&endpoint.path).await {
            Probe::Compatible(probe_info) => {
                info!(
                    session = %endpoint.session_id,
                    pid = endpoint.host_pid,
                    "discovered surviving host"
                );
                orphans.remove(&endpoint.host_pid);
                survivors.push((endpoint, probe_info));
            }
            Probe::Incompatible(version) => {
                warn!(
                    session = %endpoint.session_id,
                    version,
                    expected = EXPECTED_HOST_VERSION,
                    min = MIN_COMPATIBLE_HOST_VERSION,
                    "host version incompatible, killing"
                );
                kill_host(endpoint.host_pid);
                orphans.remove(&endpoint.host_pid);
                let _ = std::fs::remove_file(&endpoint.path);
            }
            Probe::Unresponsive => {
                warn!(session = %endpoint.session_id, "host unresponsive, killing");
                kill_host(endpoint.host_pid);
                orphans.remove(&endpoint.host_pid);
                let _ = std::fs::remove_file(&endpoint.path);
            }
            Probe::NoListener => {
                debug!(path = %endpoint.path.display(), "removing stale endpoint");
                let _ = std::fs::remove_file(&endpoint.path);
            }
        }
    }

    for pid in orphans {
        warn!(pid, "killing orphaned host with no endpoint");
        kill_host(pid);
    }

    survivors
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
