//! Sketches trying to reach past their job, under the default config.
//!
//! These hold on any host: without the jail the job never starts.

use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use sketchrun::{ResourceLimits, ResultKind, confinement_available};

use super::{default_config, emits_program, entries, no_survivors, queue, run_limits};

#[tokio::test]
async fn files_outside_the_job_are_unreadable() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.txt");
    std::fs::write(&secret, "hunter2").unwrap();

    let config = default_config(
        emits_program(&[&format!("exec cat {}", secret.display())]),
        root.path(),
    );
    let result = queue(&config).submit("").await;

    assert_ne!(result.kind, ResultKind::Success);
    assert!(!result.output.contains("hunter2"));
    assert!(!result.diagnostic.unwrap_or_default().contains("hunter2"));
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn files_outside_the_job_cannot_be_deleted() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let victim = outside.path().join("keep.txt");
    std::fs::write(&victim, "still here").unwrap();

    let config = default_config(
        emits_program(&[&format!("exec rm -f {}", victim.display())]),
        root.path(),
    );
    queue(&config).submit("").await;

    assert_eq!(std::fs::read_to_string(&victim).unwrap(), "still here");
}

#[tokio::test]
async fn local_listeners_are_unreachable() {
    if !Path::new("/bin/bash").exists() {
        eprintln!("skipping: no bash to open the connection with");
        return;
    }
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let root = tempfile::tempdir().unwrap();
    let config = default_config(
        emits_program(&[&format!(
            "exec /bin/bash -c \"echo hello > /dev/tcp/127.0.0.1/{port}\""
        )]),
        root.path(),
    );
    let result = queue(&config).submit("").await;
    assert_ne!(result.kind, ResultKind::Success);

    // A completed handshake would be waiting in the backlog
    listener.set_nonblocking(true).unwrap();
    let accepted = listener.accept();
    assert!(
        matches!(&accepted, Err(e) if e.kind() == ErrorKind::WouldBlock),
        "sketch reached the host listener: {accepted:?}"
    );
}

#[tokio::test]
async fn detached_children_die_with_the_job() {
    let root = tempfile::tempdir().unwrap();
    let mut config = default_config(
        emits_program(&["setsid sleep 65.5 &", "printf done"]),
        root.path(),
    );
    run_limits(&mut config, ResourceLimits::unlimited().with_max_processes(64));
    let jailed = confinement_available(&config).await;

    let result = queue(&config).submit("").await;

    if jailed {
        assert_eq!(result.kind, ResultKind::Success);
        assert_eq!(result.output, "done");
    }
    assert!(no_survivors("65.5").await);
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn detached_children_die_on_timeout() {
    let root = tempfile::tempdir().unwrap();
    let mut config = default_config(
        emits_program(&["setsid sleep 66.5 &", "exec sleep 30"]),
        root.path(),
    );
    run_limits(
        &mut config,
        ResourceLimits::unlimited()
            .with_max_processes(64)
            .with_wall_time_limit(1.0),
    );
    let jailed = confinement_available(&config).await;

    let result = tokio::time::timeout(Duration::from_secs(20), queue(&config).submit(""))
        .await
        .unwrap();

    if jailed {
        assert_eq!(result.kind, ResultKind::Timeout);
    }
    assert!(no_survivors("66.5").await);
    assert_eq!(entries(root.path()), 0);
}

#[tokio::test]
async fn turning_the_jail_off_exposes_the_host() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let note = outside.path().join("note.txt");
    std::fs::write(&note, "visible").unwrap();

    let mut config = default_config(
        emits_program(&[&format!("exec cat {}", note.display())]),
        root.path(),
    );
    config.confinement.enabled = false;
    let result = queue(&config).submit("").await;

    assert_eq!(result.kind, ResultKind::Success);
    assert_eq!(result.output, "visible");
}
