//! Daemon tests driven over the IPC socket

use revtun_cli::config::{ConfigManager, DaemonConfig};
use revtun_cli::daemon::Daemon;
use revtun_cli::ipc::{IpcClient, IpcRequest, IpcResponse};
use revtun_core::{
    ConnectionRegistry, ConnectionSpec, ConnectionStatus, ConnectionUpdate, ErrorKind,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

struct TestDaemon {
    socket_path: PathBuf,
    registry: ConnectionRegistry,
    updates: broadcast::Sender<Vec<ConnectionStatus>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestDaemon {
    async fn start(temp: &TempDir, config: DaemonConfig) -> Self {
        let manager = ConfigManager::new(Some(temp.path().join("data"))).unwrap();
        let daemon = Daemon::new(&manager, config).unwrap();
        let socket_path = daemon.socket_path().to_path_buf();
        let registry = daemon.registry().clone();
        let updates = daemon.updates().clone();

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(daemon.run(async {
            let _ = rx.await;
        }));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while IpcClient::connect_to(&socket_path).await.is_err() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "daemon socket never came up"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self {
            socket_path,
            registry,
            updates,
            shutdown: Some(tx),
            handle,
        }
    }

    async fn client(&self) -> IpcClient {
        IpcClient::connect_to(&self.socket_path).await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

fn fake_ssh_config() -> DaemonConfig {
    DaemonConfig {
        ssh_command: vec![
            "/bin/sh".into(),
            "-c".into(),
            "exec sleep 600".into(),
            "ssh".into(),
        ],
        tick_interval_secs: 1,
        ..Default::default()
    }
}

fn write_key(temp: &TempDir) -> PathBuf {
    let key = temp.path().join("id_web");
    std::fs::write(&key, "key").unwrap();
    key
}

fn expect_connection(response: IpcResponse) -> ConnectionStatus {
    match response {
        IpcResponse::Connection { connection } => connection,
        other => panic!("Expected Connection, got {:?}", other),
    }
}

fn expect_connections(response: IpcResponse) -> Vec<ConnectionStatus> {
    match response {
        IpcResponse::Connections { connections } => connections,
        other => panic!("Expected Connections, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping() {
    let temp = TempDir::new().unwrap();
    let daemon = TestDaemon::start(&temp, fake_ssh_config()).await;

    let mut client = daemon.client().await;
    assert_eq!(
        client.request(&IpcRequest::Ping).await.unwrap(),
        IpcResponse::Pong
    );

    daemon.stop().await;
    assert!(!temp.path().join("data").join("daemon.sock").exists());
}

#[tokio::test]
async fn test_connection_lifecycle_over_ipc() {
    let temp = TempDir::new().unwrap();
    let key = write_key(&temp);
    let daemon = TestDaemon::start(&temp, fake_ssh_config()).await;
    let mut client = daemon.client().await;

    let added = expect_connection(
        client
            .request(&IpcRequest::Add {
                connection: ConnectionSpec::new("web", 8080, 80, "203.0.113.10", &key),
            })
            .await
            .unwrap(),
    );
    assert!(!added.active);

    let started = expect_connection(
        client
            .request(&IpcRequest::Start {
                name: "web".to_string(),
            })
            .await
            .unwrap(),
    );
    assert!(started.active);

    let list = expect_connections(client.request(&IpcRequest::List).await.unwrap());
    assert_eq!(list.len(), 1);
    assert!(list[0].active);

    let updated = expect_connection(
        client
            .request(&IpcRequest::Update {
                name: "web".to_string(),
                changes: ConnectionUpdate {
                    local_port: Some(9090),
                    ..Default::default()
                },
            })
            .await
            .unwrap(),
    );
    assert_eq!(updated.spec.local_port, 9090);
    assert!(updated.active);

    let stopped = expect_connection(
        client
            .request(&IpcRequest::Stop {
                name: "web".to_string(),
            })
            .await
            .unwrap(),
    );
    assert!(!stopped.active);

    let removed = client
        .request(&IpcRequest::Remove {
            name: "web".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(removed, IpcResponse::Ok { .. }));

    let list = expect_connections(client.request(&IpcRequest::List).await.unwrap());
    assert!(list.is_empty());

    daemon.stop().await;
}

#[tokio::test]
async fn test_errors_carry_kind() {
    let temp = TempDir::new().unwrap();
    let key = write_key(&temp);
    let daemon = TestDaemon::start(&temp, fake_ssh_config()).await;
    let mut client = daemon.client().await;

    let response = client
        .request(&IpcRequest::Get {
            name: "ghost".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        response,
        IpcResponse::Error {
            kind: ErrorKind::NotFound,
            ..
        }
    ));

    let add = IpcRequest::Add {
        connection: ConnectionSpec::new("web", 8080, 80, "host", &key),
    };
    client.request(&add).await.unwrap();
    let response = client.request(&add).await.unwrap();
    assert!(matches!(
        response,
        IpcResponse::Error {
            kind: ErrorKind::Conflict,
            ..
        }
    ));

    let response = client
        .request(&IpcRequest::Add {
            connection: ConnectionSpec::new("bad", 0, 80, "host", &key),
        })
        .await
        .unwrap();
    assert!(matches!(
        response,
        IpcResponse::Error {
            kind: ErrorKind::Validation,
            ..
        }
    ));

    daemon.stop().await;
}

#[tokio::test]
async fn test_watch_streams_restart() {
    let temp = TempDir::new().unwrap();
    let key = write_key(&temp);
    let daemon = TestDaemon::start(&temp, fake_ssh_config()).await;

    let mut control = daemon.client().await;
    control
        .request(&IpcRequest::Add {
            connection: ConnectionSpec::new("web", 8080, 80, "host", &key),
        })
        .await
        .unwrap();
    control
        .request(&IpcRequest::Start {
            name: "web".to_string(),
        })
        .await
        .unwrap();

    let mut watcher = daemon.client().await;
    let initial = expect_connections(watcher.request(&IpcRequest::Watch).await.unwrap());
    assert_eq!(initial.len(), 1);
    assert!(initial[0].active);

    // kill the ssh child behind the daemon's back
    let first_pid = daemon.registry.pid("web").await.unwrap();
    unsafe {
        libc::kill(first_pid as libc::pid_t, libc::SIGKILL);
    }

    let next = tokio::time::timeout(Duration::from_secs(5), watcher.next_response())
        .await
        .expect("no snapshot after the tunnel died")
        .unwrap()
        .unwrap();
    let snapshot = expect_connections(next);
    assert_eq!(snapshot[0].spec.name, "web");
    assert!(snapshot[0].active);
    assert_ne!(daemon.registry.pid("web").await, Some(first_pid));

    daemon.stop().await;
}

#[tokio::test]
async fn test_quiet_watcher_disconnect_is_noticed() {
    let temp = TempDir::new().unwrap();
    let daemon = TestDaemon::start(&temp, fake_ssh_config()).await;

    let mut watcher = daemon.client().await;
    let initial = expect_connections(watcher.request(&IpcRequest::Watch).await.unwrap());
    assert!(initial.is_empty());
    assert_eq!(daemon.updates.receiver_count(), 1);

    // nothing is published on an empty daemon, so only the hangup can end the stream
    drop(watcher);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while daemon.updates.receiver_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "watch task outlived its client"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    daemon.stop().await;
}

#[tokio::test]
async fn test_autostart_and_persistence_across_restart() {
    let temp = TempDir::new().unwrap();
    let key = write_key(&temp);

    let daemon = TestDaemon::start(&temp, fake_ssh_config()).await;
    let mut client = daemon.client().await;
    client
        .request(&IpcRequest::Add {
            connection: ConnectionSpec::new("web", 8080, 80, "host", &key).with_user("deploy"),
        })
        .await
        .unwrap();
    drop(client);
    daemon.stop().await;

    let config = DaemonConfig {
        autostart: true,
        ..fake_ssh_config()
    };
    let daemon = TestDaemon::start(&temp, config).await;
    let mut client = daemon.client().await;

    let list = expect_connections(client.request(&IpcRequest::List).await.unwrap());
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].spec.remote_user.as_deref(), Some("deploy"));
    assert!(list[0].active);

    daemon.stop().await;
}

#[tokio::test]
async fn test_second_daemon_refused() {
    let temp = TempDir::new().unwrap();
    let daemon = TestDaemon::start(&temp, fake_ssh_config()).await;

    let manager = ConfigManager::new(Some(temp.path().join("data"))).unwrap();
    let second = Daemon::new(&manager, fake_ssh_config()).unwrap();
    assert!(second.run(std::future::pending()).await.is_err());

    daemon.stop().await;
}
