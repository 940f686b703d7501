use std::time::{Duration, Instant};

use sketchrun::{ResourceLimits, ResultKind};

use super::{emits_program, entries, no_survivors, queue, run_limits, test_config};

#[tokio::test]
async fn wall_clock_timeout_kills_the_program() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(emits_program(&["exec sleep 63.5"]), root.path()).await;
    run_limits(
        &mut config,
        ResourceLimits::unlimited()
            .with_wall_time_limit(1.0)
            .with_max_file_size(16),
    );

    let started = Instant::now();
    let result = queue(&config).submit("void setup(){} void loop(){}").await;

    assert_eq!(result.kind, ResultKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(no_survivors("63.5").await);
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn identical_submissions_get_distinct_directories() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(emits_program(&["sleep 0.5", "printf ok"]), root.path()).await;
    run_limits(&mut config, ResourceLimits::unlimited().with_max_processes(64));
    let queue = queue(&config);

    // Both jobs sit in the run phase at once, each in its own directory
    let watch = async {
        let mut most = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while most < 2 && Instant::now() < deadline {
            most = most.max(entries(root.path()));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        most
    };
    let code = "void setup(){ Serial.print(1); } void loop(){}";
    let (a, b, most) = tokio::join!(queue.submit(code), queue.submit(code), watch);

    assert_eq!(a.kind, ResultKind::Success);
    assert_eq!(b.kind, ResultKind::Success);
    assert_eq!(most, 2);
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn dropped_submission_leaves_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(emits_program(&["exec sleep 64.5"]), root.path()).await;
    run_limits(&mut config, ResourceLimits::unlimited().with_max_file_size(16));
    let queue = queue(&config);

    let cancelled =
        tokio::time::timeout(Duration::from_millis(500), queue.submit("")).await;
    assert!(cancelled.is_err());

    assert!(no_survivors("64.5").await);
    assert_eq!(entries(root.path()), 0);
    assert_eq!(queue.pending(), 0);
    assert_eq!(queue.available_workers(), queue.workers());
}
