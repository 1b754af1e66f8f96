//! ssh process supervision
//!
//! The supervisor owns one child process per connection name. It knows how to
//! spawn the ssh client for a [`ConnectionSpec`], probe whether that child is
//! still alive, and take it down (SIGTERM, grace period, then SIGKILL).
//! Restart policy is not its concern; see [`crate::monitor`].

use crate::connection::ConnectionSpec;
use crate::error::{Result, TunnelError};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, info, warn};

/// How long a child gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// ssh client looked up on `PATH`
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Program to execute (normally `ssh`)
    pub ssh_program: PathBuf,
    /// Arguments placed before the ssh options, for wrappers such as
    /// `sshpass -e ssh`
    pub ssh_program_args: Vec<OsString>,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from(DEFAULT_SSH_PROGRAM),
            ssh_program_args: Vec::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Owner of the live ssh child processes, keyed by connection name
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    processes: HashMap<String, Child>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            processes: HashMap::new(),
        }
    }

    /// Spawn ssh for `spec`
    ///
    /// Returns `Ok(false)` without side effects when a live process already
    /// exists for the connection name. Must be called inside a tokio runtime.
    pub fn start(&mut self, spec: &ConnectionSpec) -> Result<bool> {
        if self.is_active(&spec.name) {
            debug!("[{}] ssh already running, not starting another", spec.name);
            return Ok(false);
        }

        restrict_key_permissions(&spec.name, &spec.credential_path);

        let mut command = Command::new(&self.config.ssh_program);
        command
            .args(&self.config.ssh_program_args)
            .args(spec.ssh_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| {
            error!("[{}] Failed to spawn ssh: {}", spec.name, source);
            TunnelError::Spawn {
                name: spec.name.clone(),
                source,
            }
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(spec.name.clone(), stderr));
        }

        info!(
            "[{}] ssh started (pid {}): {}:{} -> localhost:{}",
            spec.name,
            child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            spec.destination(),
            spec.remote_port,
            spec.local_port
        );

        self.processes.insert(spec.name.clone(), child);
        Ok(true)
    }

    /// Non-blocking liveness probe
    ///
    /// An exited child is reaped and its handle dropped. Never restarts.
    pub fn is_active(&mut self, name: &str) -> bool {
        let Some(child) = self.processes.get_mut(name) else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("[{}] ssh exited: {}", name, status);
                self.processes.remove(name);
                false
            }
            Err(e) => {
                warn!("[{}] ssh status check failed: {}", name, e);
                self.processes.remove(name);
                false
            }
        }
    }

    /// Process id of the live child, if any
    pub fn pid(&self, name: &str) -> Option<u32> {
        self.processes.get(name).and_then(|child| child.id())
    }

    /// Terminate the child for `name`
    ///
    /// No-op when nothing is recorded. The handle is cleared even when
    /// termination reports an error.
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        let Some(mut child) = self.processes.remove(name) else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("[{}] ssh had already exited: {}", name, status);
            return Ok(());
        }

        info!("[{}] Stopping ssh...", name);
        request_termination(name, &mut child);

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!("[{}] ✅ ssh stopped ({})", name, status);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("[{}] Waiting for ssh failed: {}, killing", name, e);
                force_kill(name, child).await
            }
            Err(_) => {
                warn!(
                    "[{}] ssh did not exit within {:?}, killing",
                    name, self.config.stop_grace
                );
                force_kill(name, child).await
            }
        }
    }

    /// Stop every child
    pub async fn stop_all(&mut self) {
        let names: Vec<String> = self.processes.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                error!("[{}] {}", name, e);
            }
        }
    }
}

async fn force_kill(name: &str, mut child: Child) -> Result<()> {
    child.kill().await.map_err(|source| {
        error!("[{}] Failed to kill ssh: {}", name, source);
        TunnelError::Terminate {
            name: name.to_string(),
            source,
        }
    })
}

#[cfg(unix)]
fn request_termination(name: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                "[{}] Failed to send SIGTERM: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn request_termination(name: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("[{}] Failed to terminate ssh: {}", name, e);
    }
}

/// ssh refuses keys readable by others
#[cfg(unix)]
fn restrict_key_permissions(name: &str, path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(
            "[{}] Could not set permissions on key file {:?}: {}",
            name, path, e
        );
    }
}

#[cfg(not(unix))]
fn restrict_key_permissions(_name: &str, _path: &Path) {}

async fn log_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("[{}] ssh: {}", name, line);
    }
}
