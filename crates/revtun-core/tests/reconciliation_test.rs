//! End-to-end supervision tests with a stand-in ssh client
#![cfg(unix)]

use revtun_core::{
    ConnectionRegistry, ConnectionSpec, ConnectionStatus, ConnectionStore, NotificationSink,
    ProcessSupervisor, ReconciliationLoop, SupervisorConfig,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct CollectingSink {
    snapshots: Mutex<Vec<Vec<ConnectionStatus>>>,
}

impl NotificationSink for CollectingSink {
    fn publish(&self, snapshot: Vec<ConnectionStatus>) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}

fn fake_ssh() -> SupervisorConfig {
    SupervisorConfig {
        ssh_program: PathBuf::from("/bin/sh"),
        ssh_program_args: vec!["-c".into(), "exec sleep 600".into(), "ssh".into()],
        stop_grace: Duration::from_secs(5),
    }
}

fn open_registry(temp: &TempDir) -> ConnectionRegistry {
    ConnectionRegistry::open(
        ConnectionStore::new(temp.path().join("connections.json")),
        ProcessSupervisor::new(fake_ssh()),
    )
}

fn write_key(temp: &TempDir) -> PathBuf {
    let key = temp.path().join("id_web");
    std::fs::write(&key, "key").unwrap();
    key
}

fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[tokio::test]
async fn test_web_tunnel_lifecycle() {
    let temp = TempDir::new().unwrap();
    let registry = open_registry(&temp);
    let sink = Arc::new(CollectingSink::default());

    let spec = ConnectionSpec::new("web", 8080, 80, "203.0.113.10", write_key(&temp));
    registry.add(spec).await.unwrap();

    let status = registry.start("web").await.unwrap();
    assert!(status.active);
    let first_pid = registry.pid("web").await.unwrap();

    let monitor = ReconciliationLoop::new(registry.clone(), sink.clone())
        .with_interval(Duration::from_millis(250));
    let handle = monitor.spawn();

    // crash it out of band
    unsafe {
        libc::kill(first_pid as libc::pid_t, libc::SIGKILL);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let second_pid = loop {
        if let Some(pid) = registry.pid("web").await {
            if pid != first_pid {
                break pid;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tunnel was not restarted within 5 seconds"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert!(registry.get("web").await.unwrap().active);
    {
        let snapshots = sink.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0][0].spec.name, "web");
        assert!(snapshots[0][0].active);
    }

    registry.remove("web").await.unwrap();
    assert!(registry.list().await.is_empty());
    assert!(registry.pid("web").await.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process_exists(second_pid));

    handle.abort();
}

#[tokio::test]
async fn test_reload_starts_everything_inactive() {
    let temp = TempDir::new().unwrap();
    let key = write_key(&temp);

    {
        let registry = open_registry(&temp);
        registry
            .add(ConnectionSpec::new("web", 8080, 80, "host", &key))
            .await
            .unwrap();
        registry
            .add(ConnectionSpec::new("api", 3000, 3000, "host", &key).with_user("deploy"))
            .await
            .unwrap();
        registry.start("web").await.unwrap();
        registry.shutdown().await;
    }

    let registry = open_registry(&temp);
    let list = registry.list().await;
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].spec.name, "web");
    assert_eq!(list[1].spec.remote_user.as_deref(), Some("deploy"));
    assert!(list.iter().all(|s| !s.active));

    // nothing is wanted running after a reload, so a tick starts nothing
    let sink = Arc::new(CollectingSink::default());
    let monitor = ReconciliationLoop::new(registry.clone(), sink.clone());
    assert!(!monitor.tick().await);
    assert!(registry.pid("web").await.is_none());
}

#[tokio::test]
async fn test_corrupt_store_starts_empty() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("connections.json"), "\u{0}garbage").unwrap();

    let registry = open_registry(&temp);
    assert!(registry.list().await.is_empty());

    registry
        .add(ConnectionSpec::new("web", 8080, 80, "host", write_key(&temp)))
        .await
        .unwrap();
    assert_eq!(open_registry(&temp).list().await.len(), 1);
}
