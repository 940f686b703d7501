use sketchrun::config::{BackendKind, Config};

use super::FIXTURES_PATH;

fn fixture(name: &str) -> String {
    format!("{FIXTURES_PATH}/configs/{name}")
}

#[test]
fn test_load_valid_config() {
    let config = Config::from_file(fixture("valid_full.toml")).expect("Failed to load config");

    assert_eq!(config.backend, BackendKind::Process);
    assert_eq!(config.pool.workers, 3);
    assert_eq!(config.pool.queue_capacity, 5);
    assert_eq!(config.harness.loop_iterations, 2);
    assert_eq!(config.server.allowed_origins.len(), 2);
    assert_eq!(config.run.env.get("LANG").map(String::as_str), Some("C"));

    let run = config.run.effective_limits();
    assert_eq!(run.time_limit, Some(1.0));
    assert_eq!(run.max_output, Some(8));
    // Unnamed fields keep the run defaults
    assert_eq!(run.max_processes, Some(1));
    assert_eq!(
        config.toolchain.effective_limits().wall_time_limit,
        Some(30.0)
    );
}

#[test]
fn test_load_minimal_config() {
    let config = Config::from_file(fixture("valid_minimal.toml")).expect("Failed to load config");

    assert_eq!(config.pool.workers, 1);
    assert_eq!(config.pool.queue_capacity, 8);
    assert_eq!(config.toolchain.command[0], "g++");
}

#[test]
fn test_layered_load_starts_from_defaults() {
    let path = fixture("valid_minimal.toml");
    let config = Config::load(Some(std::path::Path::new(&path))).expect("Failed to load config");

    assert_eq!(config.pool.workers, 1);
    assert!(config.server.request_timeout > 0.0);
}

#[test]
fn test_load_invalid_zero_workers() {
    assert!(Config::from_file(fixture("invalid_no_workers.toml")).is_err());
}

#[test]
fn test_load_invalid_empty_command() {
    assert!(Config::from_file(fixture("invalid_empty_command.toml")).is_err());
}

#[test]
fn test_load_invalid_source_name() {
    assert!(Config::from_file(fixture("invalid_source_name.toml")).is_err());
}

#[test]
fn test_load_missing_file() {
    assert!(Config::from_file(fixture("does_not_exist.toml")).is_err());
}
