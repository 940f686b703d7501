//! End-to-end pipeline tests
//!
//! The toolchains here are shell one-liners that ignore the sketch and write
//! a small `/bin/sh` program to `{output}`, so the whole queue, sandbox and
//! report path runs without a C++ compiler.
//!
//! Real compiler and isolate tests live in `tests/integration`.

use std::path::Path;

use std::time::Duration;

use sketchrun::config::Config;
use sketchrun::{Executor, JobQueue, ResourceLimits, confinement_available};

mod admission;
mod config_loading;
mod escapes;
mod lifecycle;
mod meta_files;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Compile command whose "binary" is a shell script with `lines` as its body.
///
/// Lines go through `printf`, so they must not contain `'` or `%`.
pub(crate) fn emits_program(lines: &[&str]) -> Vec<String> {
    let body = lines.join("\\n");
    let script = format!("printf '#!/bin/sh\\n{body}\\n' > {{output}} && chmod +x {{output}}");
    vec!["sh".to_owned(), "-c".to_owned(), script]
}

/// Default config with jobs under `scratch_root` and the given toolchain.
///
/// Sketches run in the job jail; on hosts that cannot build it every job
/// ends in an internal error.
pub(crate) fn default_config(toolchain: Vec<String>, scratch_root: &Path) -> Config {
    let mut config = Config::default();
    config.scratch_root = scratch_root.to_path_buf();
    config.toolchain.command = toolchain;
    config
        .run
        .env
        .insert("PATH".to_owned(), "/usr/bin:/bin".to_owned());
    config
}

/// [`default_config`] with the jail turned off where the host cannot build
/// it, for tests of everything but confinement
pub(crate) async fn test_config(toolchain: Vec<String>, scratch_root: &Path) -> Config {
    let mut config = default_config(toolchain, scratch_root);
    if !confinement_available(&config).await {
        config.confinement.enabled = false;
    }
    config
}

/// Override only the named run limits
pub(crate) fn run_limits(config: &mut Config, limits: ResourceLimits) {
    config.run.limits = Some(limits);
}

pub(crate) fn queue(config: &Config) -> JobQueue {
    JobQueue::new(Executor::new(config), &config.pool)
}

pub(crate) fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Live processes whose command line contains `marker`
pub(crate) fn processes_with(marker: &str) -> usize {
    let Ok(dir) = std::fs::read_dir("/proc") else {
        return 0;
    };
    dir.flatten()
        .filter(|entry| entry.file_name().to_string_lossy().parse::<u32>().is_ok())
        .filter(|entry| {
            // Zombies are already dead, their reaper just has not run
            std::fs::read_to_string(entry.path().join("stat")).is_ok_and(|stat| {
                stat.rsplit_once(')')
                    .and_then(|(_, rest)| rest.split_whitespace().next())
                    .is_some_and(|state| state != "Z" && state != "X")
            })
        })
        .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
        .filter(|cmdline| String::from_utf8_lossy(cmdline).contains(marker))
        .count()
}

/// Wait up to two seconds for every process carrying `marker` to go away
pub(crate) async fn no_survivors(marker: &str) -> bool {
    for _ in 0..40 {
        if processes_with(marker) == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
