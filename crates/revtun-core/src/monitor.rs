//! Reconciliation loop
//!
//! Every tick compares each connection's recorded liveness with a fresh probe.
//! A connection that was running, is wanted running, and is now dead is
//! restarted immediately. Whenever any connection changes state, a snapshot
//! of the whole registry goes to the [`NotificationSink`].
//!
//! Restarts are unconditional by default (no backoff). [`RestartPolicy`] is the
//! hook for bounding them.

use crate::connection::ConnectionStatus;
use crate::registry::{ConnectionRegistry, RegistryState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default time between reconciliation passes
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Receiver of registry snapshots after a state change
pub trait NotificationSink: Send + Sync {
    fn publish(&self, snapshot: Vec<ConnectionStatus>);
}

impl NotificationSink for broadcast::Sender<Vec<ConnectionStatus>> {
    fn publish(&self, snapshot: Vec<ConnectionStatus>) {
        // no subscribers is fine
        let _ = self.send(snapshot);
    }
}

/// Decides whether a dead connection gets another automatic start
pub trait RestartPolicy: Send + Sync {
    /// `attempt` counts restarts since the process last survived a full tick,
    /// starting at 1
    fn should_restart(&self, name: &str, attempt: u32) -> bool;
}

/// Restart every time, immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRestart;

impl RestartPolicy for AlwaysRestart {
    fn should_restart(&self, _name: &str, _attempt: u32) -> bool {
        true
    }
}

/// Give up after a number of consecutive restarts that did not stick
#[derive(Debug, Clone, Copy)]
pub struct MaxAttempts(pub u32);

impl RestartPolicy for MaxAttempts {
    fn should_restart(&self, _name: &str, attempt: u32) -> bool {
        attempt <= self.0
    }
}

/// Periodic liveness reconciliation over a [`ConnectionRegistry`]
pub struct ReconciliationLoop {
    registry: ConnectionRegistry,
    sink: Arc<dyn NotificationSink>,
    policy: Box<dyn RestartPolicy>,
    interval: Duration,
}

impl ReconciliationLoop {
    pub fn new(registry: ConnectionRegistry, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            registry,
            sink,
            policy: Box::new(AlwaysRestart),
            interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_policy(mut self, policy: impl RestartPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Run one reconciliation pass; returns whether anything changed
    pub async fn tick(&self) -> bool {
        let mut state = self.registry.lock().await;
        let mut changed = false;

        for idx in 0..state.entries.len() {
            let name = state.entries[idx].spec.name.clone();
            let was_active = state.entries[idx].active;
            let active_now = state.supervisor.is_active(&name);
            let mut observed = active_now;

            if !active_now && state.entries[idx].desired_running {
                if was_active {
                    warn!("[{}] 🔄 ssh process died, restarting", name);
                    changed = true;
                }
                observed = self.restart(&mut state, idx);
                if observed && !was_active {
                    changed = true;
                }
            } else if was_active != active_now {
                changed = true;
            } else if active_now {
                state.entries[idx].restart_attempts = 0;
            }

            state.entries[idx].active = observed;
        }

        if changed {
            let snapshot = state.snapshot();
            drop(state);
            debug!("Publishing snapshot of {} connection(s)", snapshot.len());
            self.sink.publish(snapshot);
        }

        changed
    }

    /// Automatic restart of the entry at `idx`; returns whether it is running
    fn restart(&self, state: &mut RegistryState, idx: usize) -> bool {
        let entry = &mut state.entries[idx];
        let attempt = entry.restart_attempts.saturating_add(1);

        if !self.policy.should_restart(&entry.spec.name, attempt) {
            error!(
                "[{}] 🚫 Giving up after {} restart attempt(s)",
                entry.spec.name, entry.restart_attempts
            );
            entry.desired_running = false;
            return false;
        }
        entry.restart_attempts = attempt;

        match state.supervisor.start(&entry.spec) {
            Ok(_) => {
                info!("[{}] ✅ Restarted (attempt {})", entry.spec.name, attempt);
                true
            }
            Err(e) => {
                error!("[{}] Restart failed, retrying next tick: {}", entry.spec.name, e);
                false
            }
        }
    }

    /// Reconcile forever at the configured interval
    pub async fn run(self) {
        info!("Reconciliation loop running every {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick of a tokio interval fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
