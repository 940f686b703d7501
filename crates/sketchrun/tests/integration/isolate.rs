use sketchrun::config::{BackendKind, Config};
use sketchrun::{ExecutionResult, ResultKind, prepare_cgroup};

use super::{default_config, fixture_sketch, queue};

/// Isolate config with cgroup support if available, falling back to non-cgroup mode.
fn isolate_config(scratch_root: &std::path::Path, first_box_id: u32) -> Config {
    let mut config = default_config(scratch_root);
    config.backend = BackendKind::Isolate;
    config.isolate.first_box_id = first_box_id;
    if config.isolate.cgroup {
        match prepare_cgroup(&config.isolate.cg_root) {
            Ok(true) => {}                      // cgroups ready
            _ => config.isolate.cgroup = false, // not available, fall back
        }
    }
    config
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_hello() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&isolate_config(root.path(), 60))
        .submit(&fixture_sketch("hello.ino"))
        .await;

    assert_eq!(result, ExecutionResult::success("hi"));
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_compile_error() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&isolate_config(root.path(), 62))
        .submit(&fixture_sketch("syntax_error.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::CompileError);
    assert!(result.diagnostic.unwrap().contains("expected"));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_infinite_loop() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&isolate_config(root.path(), 64))
        .submit(&fixture_sketch("infinite_loop.ino"))
        .await;

    assert_eq!(result, ExecutionResult::timeout());
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_crash() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&isolate_config(root.path(), 66))
        .submit(&fixture_sketch("crash.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::RuntimeError);
}
