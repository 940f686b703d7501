//! Real sketches reaching outside their job, under the default config

use std::io::ErrorKind;
use std::net::TcpListener;

use sketchrun::{ResourceLimits, ResultKind, confinement_available};

use super::{default_config, no_survivors, queue};

#[tokio::test]
async fn test_sketch_cannot_read_host_files() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.txt");
    std::fs::write(&secret, "hunter2").unwrap();

    let code = r#"
#include <fstream>
void setup() {
    std::ifstream in("SECRET");
    std::string text;
    if (in >> text) Serial.print(text); else Serial.print("blocked");
}
void loop() {}
"#
    .replace("SECRET", &secret.display().to_string());
    let result = queue(&default_config(root.path())).submit(&code).await;

    assert!(!result.output.contains("hunter2"));
    assert!(!result.diagnostic.unwrap_or_default().contains("hunter2"));
}

#[tokio::test]
async fn test_sketch_cannot_delete_host_files() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let victim = outside.path().join("keep.txt");
    std::fs::write(&victim, "still here").unwrap();

    let code = r#"
#include <cstdio>
void setup() { Serial.print(std::remove("VICTIM") == 0 ? "removed" : "kept"); }
void loop() {}
"#
    .replace("VICTIM", &victim.display().to_string());
    let result = queue(&default_config(root.path())).submit(&code).await;

    assert_ne!(result.output, "removed");
    assert_eq!(std::fs::read_to_string(&victim).unwrap(), "still here");
}

#[tokio::test]
async fn test_sketch_cannot_connect_to_local_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let root = tempfile::tempdir().unwrap();
    let code = r#"
#include <arpa/inet.h>
#include <sys/socket.h>
void setup() {
    int fd = socket(AF_INET, SOCK_STREAM, 0);
    sockaddr_in addr{};
    addr.sin_family = AF_INET;
    addr.sin_port = htons(PORT);
    addr.sin_addr.s_addr = htonl(INADDR_LOOPBACK);
    bool ok = fd >= 0 && connect(fd, (sockaddr*)&addr, sizeof addr) == 0;
    Serial.print(ok ? "connected" : "refused");
}
void loop() {}
"#
    .replace("PORT", &port.to_string());
    let result = queue(&default_config(root.path())).submit(&code).await;

    assert_ne!(result.output, "connected");
    listener.set_nonblocking(true).unwrap();
    let accepted = listener.accept();
    assert!(
        matches!(&accepted, Err(e) if e.kind() == ErrorKind::WouldBlock),
        "sketch reached the host listener: {accepted:?}"
    );
}

#[tokio::test]
async fn test_detached_grandchild_dies_with_the_job() {
    let root = tempfile::tempdir().unwrap();
    let mut config = default_config(root.path());
    config.run.limits = Some(ResourceLimits::unlimited().with_max_processes(64));
    let jailed = confinement_available(&config).await;

    let code = r#"
#include <unistd.h>
void setup() {
    if (fork() == 0) {
        setsid();
        execl("/bin/sleep", "sleep", "67.5", (char*)nullptr);
        _exit(1);
    }
    Serial.print("parent done");
}
void loop() {}
"#;
    let result = queue(&config).submit(code).await;

    if jailed {
        assert_eq!(result.kind, ResultKind::Success);
        assert_eq!(result.output, "parent done");
    }
    assert!(no_survivors("67.5").await);
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}
