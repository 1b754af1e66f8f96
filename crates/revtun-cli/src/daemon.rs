//! Daemon mode: hosts the connection registry and reconciliation loop
//!
//! The daemon owns every ssh child. CLI invocations reach it over the IPC
//! socket; `watch` clients receive the loop's snapshots.

use anyhow::Result;
use revtun_core::{
    AlwaysRestart, ConnectionRegistry, ConnectionStatus, ConnectionStore, ErrorKind, MaxAttempts,
    ProcessSupervisor, ReconciliationLoop,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigManager, DaemonConfig};
use crate::ipc::{IpcConnection, IpcRequest, IpcResponse, IpcServer};

/// Snapshots buffered per watcher before it starts lagging
const WATCH_BUFFER: usize = 64;

/// Daemon for supervising reverse tunnels
pub struct Daemon {
    registry: ConnectionRegistry,
    config: DaemonConfig,
    socket_path: PathBuf,
    updates: broadcast::Sender<Vec<ConnectionStatus>>,
}

impl Daemon {
    /// Create a daemon from the configuration under `manager`'s data directory
    pub fn new(manager: &ConfigManager, config: DaemonConfig) -> Result<Self> {
        let supervisor = ProcessSupervisor::new(config.supervisor_config()?);
        let store_path = manager.store_path(&config);
        info!("Loading connections from {:?}", store_path);

        let registry = ConnectionRegistry::open(ConnectionStore::new(store_path), supervisor);
        let (updates, _) = broadcast::channel(WATCH_BUFFER);

        Ok(Self {
            registry,
            config,
            socket_path: manager.socket_path(),
            updates,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sender behind `watch`; its receiver count is the number of live watchers
    pub fn updates(&self) -> &broadcast::Sender<Vec<ConnectionStatus>> {
        &self.updates
    }

    /// Run until `shutdown` resolves, then stop every tunnel
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("🚀 Daemon starting...");

        let server = IpcServer::bind_to(&self.socket_path).await?;
        info!("IPC server listening at {:?}", server.path());

        let connections = self.registry.list().await;
        info!("Found {} connection(s)", connections.len());

        if self.config.autostart {
            let started = self.registry.start_all().await;
            info!("Autostarted {} connection(s)", started);
        }

        let monitor = ReconciliationLoop::new(self.registry.clone(), Arc::new(self.updates.clone()))
            .with_interval(self.config.tick_interval());
        let monitor = match self.config.max_restart_attempts {
            Some(max) => monitor.with_policy(MaxAttempts(max)),
            None => monitor.with_policy(AlwaysRestart),
        };
        let monitor_task = monitor.spawn();

        let ipc_task = tokio::spawn(Self::run_ipc_server(
            server,
            self.registry.clone(),
            self.updates.clone(),
        ));

        info!("✅ Daemon ready");
        shutdown.await;

        info!("Shutting down daemon...");
        monitor_task.abort();
        ipc_task.abort();
        // the server drops with the task and removes its socket
        let _ = ipc_task.await;

        self.registry.shutdown().await;

        info!("✅ Daemon stopped");
        Ok(())
    }

    /// Accept CLI connections, one task per client
    async fn run_ipc_server(
        server: IpcServer,
        registry: ConnectionRegistry,
        updates: broadcast::Sender<Vec<ConnectionStatus>>,
    ) {
        loop {
            match server.accept().await {
                Ok(conn) => {
                    tokio::spawn(Self::serve_client(conn, registry.clone(), updates.clone()));
                }
                Err(e) => {
                    error!("IPC accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_client(
        mut conn: IpcConnection,
        registry: ConnectionRegistry,
        updates: broadcast::Sender<Vec<ConnectionStatus>>,
    ) {
        loop {
            let request = match conn.recv().await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    warn!("IPC recv error: {}", e);
                    let response = IpcResponse::Error {
                        kind: ErrorKind::Validation,
                        message: format!("{:#}", e),
                    };
                    if conn.send(&response).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            if matches!(request, IpcRequest::Watch) {
                let rx = updates.subscribe();
                drop(updates);
                Self::stream_updates(conn, &registry, rx).await;
                return;
            }

            let response = Self::handle_request(&registry, request).await;
            if let Err(e) = conn.send(&response).await {
                warn!("IPC send error: {}", e);
                return;
            }
        }
    }

    /// Handle a single request/response exchange
    pub async fn handle_request(registry: &ConnectionRegistry, request: IpcRequest) -> IpcResponse {
        debug!("IPC request: {:?}", request);

        let result = match request {
            IpcRequest::Ping => return IpcResponse::Pong,
            IpcRequest::List => {
                return IpcResponse::Connections {
                    connections: registry.list().await,
                }
            }
            IpcRequest::Get { name } => registry.get(&name).await,
            IpcRequest::Add { connection } => registry.add(connection).await,
            IpcRequest::Update { name, changes } => registry.update(&name, changes).await,
            IpcRequest::Remove { name } => {
                return match registry.remove(&name).await {
                    Ok(()) => IpcResponse::ok(format!("Connection '{}' removed", name)),
                    Err(e) => e.into(),
                };
            }
            IpcRequest::Start { name } => registry.start(&name).await,
            IpcRequest::Stop { name } => registry.stop(&name).await,
            IpcRequest::Watch => {
                return IpcResponse::Error {
                    kind: ErrorKind::Validation,
                    message: "watch needs a dedicated connection".to_string(),
                }
            }
        };

        match result {
            Ok(connection) => IpcResponse::Connection { connection },
            Err(e) => e.into(),
        }
    }

    /// Send the current list, then every published snapshot until the client leaves
    async fn stream_updates(
        mut conn: IpcConnection,
        registry: &ConnectionRegistry,
        mut rx: broadcast::Receiver<Vec<ConnectionStatus>>,
    ) {
        let current = IpcResponse::Connections {
            connections: registry.list().await,
        };
        if conn.send(&current).await.is_err() {
            return;
        }

        loop {
            let connections = tokio::select! {
                snapshot = rx.recv() => match snapshot {
                    Ok(snapshot) => snapshot,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Watcher lagged by {} snapshot(s)", skipped);
                        registry.list().await
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                // a watcher only ever hangs up; anything it sends is ignored
                request = conn.recv() => match request {
                    Ok(Some(request)) => {
                        debug!("Ignoring {:?} on a watch connection", request);
                        continue;
                    }
                    Ok(None) | Err(_) => {
                        debug!("Watcher disconnected");
                        return;
                    }
                },
            };

            if conn
                .send(&IpcResponse::Connections { connections })
                .await
                .is_err()
            {
                debug!("Watcher disconnected");
                return;
            }
        }
    }
}
