//! Reverse SSH tunnel supervision engine
//!
//! Keeps a durable set of named reverse tunnels, runs one `ssh -N -R` process
//! per tunnel, and reconciles process liveness against what the user wants
//! running, restarting tunnels that die.

pub mod connection;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod store;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::{ConnectionSpec, ConnectionStatus, ConnectionUpdate};
pub use error::{ErrorKind, ErrorPayload, Result, TunnelError};
pub use monitor::{
    AlwaysRestart, MaxAttempts, NotificationSink, ReconciliationLoop, RestartPolicy,
    DEFAULT_TICK_INTERVAL,
};
pub use registry::ConnectionRegistry;
pub use store::ConnectionStore;
pub use supervisor::{ProcessSupervisor, SupervisorConfig, DEFAULT_STOP_GRACE};
