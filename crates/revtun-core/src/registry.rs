//! Connection registry
//!
//! The registry is the in-memory source of truth: every connection's settings
//! plus the runtime flags the reconciliation loop needs. All mutations, from
//! callers and from the monitor alike, go through one mutex, so a user stop
//! can never interleave with an automatic restart of the same connection.

use crate::connection::{ConnectionSpec, ConnectionStatus, ConnectionUpdate};
use crate::error::{Result, TunnelError};
use crate::store::ConnectionStore;
use crate::supervisor::ProcessSupervisor;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// A connection plus runtime-only state (never persisted)
#[derive(Debug, Clone)]
pub(crate) struct ConnectionEntry {
    pub(crate) spec: ConnectionSpec,
    /// Liveness recorded by the last reconciliation pass or explicit action
    pub(crate) active: bool,
    /// Whether the user wants this tunnel running
    pub(crate) desired_running: bool,
    /// Automatic restarts since the process last survived a full tick
    pub(crate) restart_attempts: u32,
}

impl ConnectionEntry {
    fn new(spec: ConnectionSpec) -> Self {
        Self {
            spec,
            active: false,
            desired_running: false,
            restart_attempts: 0,
        }
    }
}

/// Everything guarded by the registry lock
pub(crate) struct RegistryState {
    pub(crate) entries: Vec<ConnectionEntry>,
    pub(crate) supervisor: ProcessSupervisor,
    store: ConnectionStore,
}

impl RegistryState {
    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.spec.name == name)
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| TunnelError::NotFound(name.to_string()))
    }

    fn persist(&self) -> Result<()> {
        let specs: Vec<ConnectionSpec> = self.entries.iter().map(|e| e.spec.clone()).collect();
        self.store.save(&specs)
    }

    pub(crate) fn status_at(&mut self, idx: usize) -> ConnectionStatus {
        let spec = self.entries[idx].spec.clone();
        let active = self.supervisor.is_active(&spec.name);
        ConnectionStatus { spec, active }
    }

    /// Snapshot of all entries in insertion order, probing each process
    pub(crate) fn snapshot(&mut self) -> Vec<ConnectionStatus> {
        (0..self.entries.len()).map(|idx| self.status_at(idx)).collect()
    }

    /// Explicitly start the entry at `idx`
    fn start_entry(&mut self, idx: usize) -> Result<bool> {
        let entry = &mut self.entries[idx];
        match self.supervisor.start(&entry.spec) {
            Ok(started) => {
                if started {
                    entry.active = true;
                    entry.desired_running = true;
                    entry.restart_attempts = 0;
                }
                Ok(started)
            }
            Err(e) => {
                entry.active = false;
                entry.desired_running = false;
                Err(e)
            }
        }
    }

    /// Explicitly stop the entry at `idx`; it ends up inactive either way
    async fn stop_entry(&mut self, idx: usize) -> Result<()> {
        let entry = &mut self.entries[idx];
        entry.desired_running = false;
        entry.active = false;
        entry.restart_attempts = 0;
        self.supervisor.stop(&entry.spec.name).await
    }
}

/// Shared handle to the connection registry
#[derive(Clone)]
pub struct ConnectionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ConnectionRegistry {
    /// Build a registry from the persisted store
    ///
    /// Every loaded entry starts inactive and not desired-running.
    pub fn open(store: ConnectionStore, supervisor: ProcessSupervisor) -> Self {
        let entries = store.load().into_iter().map(ConnectionEntry::new).collect();
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                entries,
                supervisor,
                store,
            })),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().await
    }

    /// Add a new connection (inactive) and persist it
    pub async fn add(&self, mut spec: ConnectionSpec) -> Result<ConnectionStatus> {
        spec.remote_user = spec.remote_user.filter(|user| !user.is_empty());
        let mut state = self.lock().await;

        if state.position(&spec.name).is_some() {
            return Err(TunnelError::DuplicateName(spec.name));
        }
        spec.validate()?;

        info!("[{}] Adding connection ({})", spec.name, spec.destination());
        state.entries.push(ConnectionEntry::new(spec));
        state.persist()?;

        let idx = state.entries.len() - 1;
        Ok(state.status_at(idx))
    }

    /// Apply a partial update, restarting the tunnel if it was running
    ///
    /// A rename re-keys the entry in place, so there is never a moment where
    /// both or neither name exist.
    pub async fn update(&self, name: &str, update: ConnectionUpdate) -> Result<ConnectionStatus> {
        let mut state = self.lock().await;
        let idx = state.require(name)?;

        let candidate = update.apply(&state.entries[idx].spec);
        if candidate.name != name && state.position(&candidate.name).is_some() {
            return Err(TunnelError::DuplicateName(candidate.name));
        }
        candidate.validate()?;

        let was_running = state.supervisor.is_active(name);
        if was_running {
            info!("[{}] Stopping for reconfiguration", name);
            if let Err(e) = state.stop_entry(idx).await {
                warn!("[{}] Update aborted: {}", name, e);
                return Err(e);
            }
        }

        if candidate.name != name {
            info!("[{}] Renaming to '{}'", name, candidate.name);
        }
        state.entries[idx].spec = candidate;

        let restarted = if was_running {
            state.start_entry(idx).map(|_| ())
        } else {
            Ok(())
        };

        state.persist()?;
        restarted?;
        Ok(state.status_at(idx))
    }

    /// Stop (if running) and delete a connection
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.lock().await;
        let idx = state.require(name)?;

        if let Err(e) = state.stop_entry(idx).await {
            warn!("[{}] {}; removing anyway", name, e);
        }

        state.entries.remove(idx);
        info!("[{}] Connection removed", name);
        state.persist()
    }

    /// Explicitly start a connection
    pub async fn start(&self, name: &str) -> Result<ConnectionStatus> {
        let mut state = self.lock().await;
        let idx = state.require(name)?;

        if !state.start_entry(idx)? {
            return Err(TunnelError::AlreadyRunning(name.to_string()));
        }
        Ok(state.status_at(idx))
    }

    /// Explicitly stop a connection; stopping an inactive one is a no-op
    pub async fn stop(&self, name: &str) -> Result<ConnectionStatus> {
        let mut state = self.lock().await;
        let idx = state.require(name)?;

        state.stop_entry(idx).await?;
        Ok(state.status_at(idx))
    }

    /// Start every connection that is not running; returns how many started
    pub async fn start_all(&self) -> usize {
        let mut state = self.lock().await;
        let mut started = 0;

        for idx in 0..state.entries.len() {
            match state.start_entry(idx) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => error!("[{}] {}", state.entries[idx].spec.name, e),
            }
        }

        started
    }

    /// Stop every process, e.g. on daemon exit
    pub async fn shutdown(&self) {
        let mut state = self.lock().await;
        for entry in state.entries.iter_mut() {
            entry.active = false;
            entry.desired_running = false;
        }
        state.supervisor.stop_all().await;
    }

    /// Snapshot of all connections in insertion order
    pub async fn list(&self) -> Vec<ConnectionStatus> {
        self.lock().await.snapshot()
    }

    /// Status of one connection
    pub async fn get(&self, name: &str) -> Result<ConnectionStatus> {
        let mut state = self.lock().await;
        let idx = state.require(name)?;
        Ok(state.status_at(idx))
    }

    /// Process id of a running connection
    pub async fn pid(&self, name: &str) -> Option<u32> {
        self.lock().await.supervisor.pid(name)
    }
}
