use sketchrun::{ResourceLimits, ResultKind};
use sketchrun::config::PoolConfig;

use super::{emits_program, entries, queue, run_limits, test_config};

#[tokio::test]
async fn saturated_pool_rejects_the_overflow() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(emits_program(&["sleep 0.3", "printf done"]), root.path()).await;
    config.pool = PoolConfig {
        workers: 1,
        queue_capacity: 1,
    };
    // The script forks `sleep`
    run_limits(&mut config, ResourceLimits::unlimited().with_max_processes(64));
    let queue = queue(&config);

    let results = {
        let (a, b, c) = tokio::join!(queue.submit(""), queue.submit(""), queue.submit(""));
        [a, b, c]
    };

    let done = results
        .iter()
        .filter(|r| r.kind == ResultKind::Success && r.output == "done")
        .count();
    let rejected = results
        .iter()
        .filter(|r| r.kind == ResultKind::Rejected)
        .count();
    assert_eq!(done, 2);
    assert_eq!(rejected, 1);

    // Rejection is not sticky
    assert_eq!(queue.pending(), 0);
    assert_eq!(queue.submit("").await.kind, ResultKind::Success);
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn queued_jobs_wait_for_a_worker() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(emits_program(&["sleep 0.2", "pwd"]), root.path()).await;
    config.pool = PoolConfig {
        workers: 1,
        queue_capacity: 3,
    };
    run_limits(&mut config, ResourceLimits::unlimited().with_max_processes(64));
    let queue = queue(&config);

    let (a, b, c, d) = tokio::join!(
        queue.submit(""),
        queue.submit(""),
        queue.submit(""),
        queue.submit("")
    );

    for result in [&a, &b, &c, &d] {
        assert_eq!(result.kind, ResultKind::Success);
    }
    assert_eq!(queue.available_workers(), 1);
    assert_eq!(entries(root.path()), 0);
}
