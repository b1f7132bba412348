// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::cmp::Ordering;

use super::*;

#[yare::parameterized(
    equal = { "1.2.3", "1.2.3", Some(Ordering::Equal) },
    patch_greater = { "1.2.4", "1.2.3", Some(Ordering::Greater) },
    minor_less = { "1.1.9", "1.2.0", Some(Ordering::Less) },
    major_wins = { "2.0.0", "1.9.9", Some(Ordering::Greater) },
    short_form = { "1.2", "1.2.0", Some(Ordering::Equal) },
    garbage = { "1.two.3", "1.2.3", None },
    extra_component = { "1.2.3.4", "1.2.3", None },
)]
fn semver_comparisons(a: &str, b: &str, expected: Option<Ordering>) {
    assert_eq!(semver_compare(a, b), expected);
}

#[test]
fn exact_version_is_compatible() {
    assert!(version_compatible(EXPECTED_HOST_VERSION));
}

#[test]
fn at_or_above_minimum_is_compatible() {
    assert!(version_compatible(MIN_COMPATIBLE_HOST_VERSION));
    assert!(version_compatible("99.0.0"));
}

#[test]
fn below_minimum_is_incompatible() {
    assert!(!version_compatible("0.0.1"));
}

#[test]
fn unparseable_version_is_incompatible() {
    assert!(!version_compatible("nightly"));
}

#[test]
fn scan_finds_only_well_formed_endpoints() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("mthost-a1b2c3d4-100.sock"), b"")?;
    std::fs::write(dir.path().join("mthost-00ff00ff-200.sock"), b"")?;
    std::fs::write(dir.path().join("mthost-bogus.sock"), b"")?;
    std::fs::write(dir.path().join("unrelated.txt"), b"")?;

    let endpoints = scan_endpoints(dir.path());
    let ids: Vec<(&str, u32)> =
        endpoints.iter().map(|e| (e.session_id.as_str(), e.host_pid)).collect();
    assert_eq!(ids, vec![("00ff00ff", 200), ("a1b2c3d4", 100)]);
    Ok(())
}

#[test]
fn scan_of_missing_dir_is_empty() {
    assert!(scan_endpoints(std::path::Path::new("/nonexistent/mterm")).is_empty());
}

#[tokio::test]
async fn probe_classifies_missing_listener_as_stale() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mthost-a1b2c3d4-1.sock");
    std::fs::write(&path, b"")?;

    assert!(matches!(probe(&path).await, Probe::NoListener));
    Ok(())
}

#[tokio::test]
async fn probe_classifies_silent_listener_as_unresponsive() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mthost-a1b2c3d4-1.sock");
    let listener = tokio::net::UnixListener::bind(&path)?;
    let server = tokio::spawn(async move {
        // Accept and say nothing.
        let _conn = listener.accept().await;
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    });

    assert!(matches!(probe(&path).await, Probe::Unresponsive));
    server.abort();
    Ok(())
}

#[tokio::test]
async fn discover_removes_stale_endpoints() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stale = dir.path().join("mthost-a1b2c3d4-4194000.sock");
    std::fs::write(&stale, b"")?;

    let survivors = discover(dir.path(), Default::default()).await;
    assert!(survivors.is_empty());
    assert!(!stale.exists());
    Ok(())
}
