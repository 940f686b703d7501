//! Integration tests against a real C++ toolchain
//!
//! These tests need `g++` on the host.
//! Run with: cargo test -p sketchrun --features integration-tests
//!
//! Isolate tests additionally need the isolate binary and root, and are
//! marked `#[ignore]`. To include them:
//!    cargo test -p sketchrun --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::fs;
use std::path::Path;
use std::time::Duration;

use sketchrun::config::Config;
use sketchrun::{Executor, JobQueue, confinement_available};

mod confinement;
mod http;
mod isolate;
mod sketches;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get a fixture sketch
pub(crate) fn fixture_sketch(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sketches/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Default config with jobs kept under `scratch_root`
pub(crate) fn default_config(scratch_root: &Path) -> Config {
    let mut config = Config::default();
    config.scratch_root = scratch_root.to_path_buf();
    config
}

/// [`default_config`], unjailed where this host cannot build the jail
pub(crate) async fn test_config(scratch_root: &Path) -> Config {
    let mut config = default_config(scratch_root);
    if !confinement_available(&config).await {
        config.confinement.enabled = false;
    }
    config
}

pub(crate) fn queue(config: &Config) -> JobQueue {
    JobQueue::new(Executor::new(config), &config.pool)
}

/// Wait up to two seconds for no live process to carry `marker` in its
/// command line
pub(crate) async fn no_survivors(marker: &str) -> bool {
    for _ in 0..40 {
        let alive = fs::read_dir("/proc")
            .into_iter()
            .flatten()
            .flatten()
            .filter(|entry| {
                fs::read_to_string(entry.path().join("stat")).is_ok_and(|stat| {
                    stat.rsplit_once(')')
                        .and_then(|(_, rest)| rest.split_whitespace().next())
                        .is_some_and(|state| state != "Z" && state != "X")
                })
            })
            .filter_map(|entry| fs::read(entry.path().join("cmdline")).ok())
            .any(|cmdline| String::from_utf8_lossy(&cmdline).contains(marker));
        if !alive {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
