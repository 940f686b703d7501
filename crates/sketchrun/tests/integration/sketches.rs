use sketchrun::config::HarnessConfig;
use sketchrun::{ExecutionResult, ResultKind};

use super::{fixture_sketch, queue, test_config};

#[tokio::test]
async fn test_println_hi() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(r#"void setup(){ Serial.println("hi"); } void loop(){}"#)
        .await;

    assert_eq!(result, ExecutionResult::success("hi"));
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_hello_fixture() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(&fixture_sketch("hello.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::Success);
    assert_eq!(result.output, "hi");
}

#[tokio::test]
async fn test_loop_runs_configured_times() {
    let root = tempfile::tempdir().unwrap();
    let code = fixture_sketch("counter.ino");

    let once = queue(&test_config(root.path()).await).submit(&code).await;
    assert_eq!(once.output, "start 1");

    let mut config = test_config(root.path()).await;
    config.harness = HarnessConfig {
        loop_iterations: 3,
        println_newline: true,
    };
    let thrice = queue(&config).submit(&code).await;
    assert_eq!(thrice.output, "start 123");
}

#[tokio::test]
async fn test_println_newline_option() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path()).await;
    config.harness.println_newline = true;

    let result = queue(&config)
        .submit(r#"void setup(){ Serial.println("a"); Serial.println(2); } void loop(){}"#)
        .await;
    assert_eq!(result.output, "a\n2\n");
}

#[tokio::test]
async fn test_syntax_error_points_at_sketch() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(&fixture_sketch("syntax_error.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::CompileError);
    let diagnostic = result.diagnostic.unwrap();
    assert!(diagnostic.contains("expected"));
    assert!(diagnostic.contains("sketch.ino:1"));
}

#[tokio::test]
async fn test_empty_code_is_compile_error() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(&fixture_sketch("empty.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::CompileError);
}

#[tokio::test]
async fn test_empty_code_hides_host_paths() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(&fixture_sketch("empty.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::CompileError);
    let diagnostic = result.diagnostic.unwrap();
    assert!(diagnostic.contains("setup"));
    assert!(!diagnostic.contains(&*root.path().to_string_lossy()));
    let canonical = root.path().canonicalize().unwrap();
    assert!(!diagnostic.contains(&*canonical.to_string_lossy()));
}

#[tokio::test]
async fn test_missing_setup_is_compile_error() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(&fixture_sketch("missing_setup.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::CompileError);
    assert!(result.diagnostic.unwrap().contains("setup"));
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(&fixture_sketch("infinite_loop.ino"))
        .await;

    assert_eq!(result, ExecutionResult::timeout());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_null_dereference_is_runtime_error() {
    let root = tempfile::tempdir().unwrap();
    let result = queue(&test_config(root.path()).await)
        .submit(&fixture_sketch("crash.ino"))
        .await;

    assert_eq!(result.kind, ResultKind::RuntimeError);
    assert!(result.diagnostic.unwrap().contains("SIGSEGV"));
}
