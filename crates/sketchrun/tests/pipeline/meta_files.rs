use sketchrun::sandbox::isolate::MetaFile;
use sketchrun::sandbox::{Captured, PhaseStatus};

use super::FIXTURES_PATH;

async fn load_meta_fixture(name: &str) -> MetaFile {
    let path = format!("{FIXTURES_PATH}/meta/{name}");
    MetaFile::load(&path)
        .await
        .unwrap_or_else(|e| panic!("Failed to read meta fixture {path}: {e}"))
}

#[tokio::test]
async fn test_meta_success() {
    let meta = load_meta_fixture("success.meta").await;
    assert_eq!(meta.status(), PhaseStatus::Ok);
    assert_eq!(meta.exit_code(), Some(0));
    assert!((meta.wall_time() - 0.051).abs() < 0.001);
}

#[tokio::test]
async fn test_meta_time_limit() {
    let meta = load_meta_fixture("tle.meta").await;
    assert_eq!(meta.status(), PhaseStatus::TimeLimitExceeded);

    let outcome = meta.into_outcome(Captured::default(), Captured::default());
    assert!(outcome.is_timeout());
}

#[tokio::test]
async fn test_meta_signal() {
    let meta = load_meta_fixture("signal.meta").await;
    assert_eq!(meta.status(), PhaseStatus::Signaled);
    assert_eq!(meta.signal(), Some(11));
}

#[tokio::test]
async fn test_meta_runtime_error() {
    let meta = load_meta_fixture("runtime_error.meta").await;
    assert_eq!(meta.status(), PhaseStatus::RuntimeError);
    assert_eq!(meta.exit_code(), Some(3));

    let outcome = meta.into_outcome(Captured::default(), Captured::default());
    assert_eq!(outcome.termination(), "exited with code 3");
}

#[tokio::test]
async fn test_meta_internal_error() {
    let meta = load_meta_fixture("internal.meta").await;
    assert_eq!(meta.status(), PhaseStatus::InternalError);
    assert!(meta.message().unwrap().contains("clone failed"));
}
