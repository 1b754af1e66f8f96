//! Tunnel connection model
//!
//! A [`ConnectionSpec`] is the durable description of one reverse tunnel: which
//! remote port is bound on the far host, which local port it forwards back to,
//! and how the ssh client should authenticate and keep the session alive.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Deserializer, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;

/// Default ssh server port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default `ServerAliveInterval` in seconds
pub const DEFAULT_KEEPALIVE_INTERVAL: u32 = 60;

pub(crate) fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

pub(crate) fn default_keepalive_interval() -> u32 {
    DEFAULT_KEEPALIVE_INTERVAL
}

pub(crate) fn default_exit_on_forward_failure() -> bool {
    true
}

/// An empty user string means "no user"
pub(crate) fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Durable description of one reverse tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Unique connection name (registry key)
    pub name: String,
    /// Port of the local service the tunnel forwards to
    pub local_port: u16,
    /// Port bound on the remote host
    pub remote_port: u16,
    /// Address or hostname of the remote ssh server
    pub remote_host: String,
    /// Login user; when absent ssh picks the default identity
    #[serde(default, deserialize_with = "empty_as_none")]
    pub remote_user: Option<String>,
    /// Private key used for authentication
    pub credential_path: PathBuf,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_seconds: u32,
    #[serde(default = "default_exit_on_forward_failure")]
    pub exit_on_forward_failure: bool,
}

impl ConnectionSpec {
    /// Create a spec with default ssh port, keepalive and exit policy
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        remote_port: u16,
        remote_host: impl Into<String>,
        credential_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            local_port,
            remote_port,
            remote_host: remote_host.into(),
            remote_user: None,
            credential_path: credential_path.into(),
            ssh_port: DEFAULT_SSH_PORT,
            keepalive_interval_seconds: DEFAULT_KEEPALIVE_INTERVAL,
            exit_on_forward_failure: true,
        }
    }

    /// Set the login user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.remote_user = Some(user.into());
        self
    }

    /// Validate every field, including that the credential file exists
    pub fn validate(&self) -> Result<()> {
        self.validate_fields()?;

        if !self.credential_path.is_file() {
            return Err(TunnelError::Validation(format!(
                "SSH key file not found: {}",
                self.credential_path.display()
            )));
        }

        Ok(())
    }

    /// Validate field shapes without touching the filesystem
    pub fn validate_fields(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.remote_host.is_empty() {
            return Err(invalid("remote_host is required"));
        }
        if self.remote_host.starts_with('-') || self.remote_host.contains(char::is_whitespace) {
            return Err(invalid(format!(
                "remote_host '{}' is not a valid host",
                self.remote_host
            )));
        }

        if let Some(user) = &self.remote_user {
            if user.is_empty()
                || user.starts_with('-')
                || user.contains(char::is_whitespace)
                || user.contains('@')
            {
                return Err(invalid(format!("remote_user '{}' is not valid", user)));
            }
        }

        for (field, port) in [
            ("local_port", self.local_port),
            ("remote_port", self.remote_port),
            ("ssh_port", self.ssh_port),
        ] {
            if port == 0 {
                return Err(invalid(format!("{} must be between 1 and 65535", field)));
            }
        }

        if self.credential_path.as_os_str().is_empty() {
            return Err(invalid("credential_path is required"));
        }

        Ok(())
    }

    /// ssh destination, `user@host` or just `host`
    pub fn destination(&self) -> String {
        match &self.remote_user {
            Some(user) => format!("{}@{}", user, self.remote_host),
            None => self.remote_host.clone(),
        }
    }

    /// Arguments for a non-interactive, forwarding-only ssh session
    pub fn ssh_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-N".into(),
            "-R".into(),
            format!("{}:localhost:{}", self.remote_port, self.local_port).into(),
            "-i".into(),
            self.credential_path.clone().into_os_string(),
            "-p".into(),
            self.ssh_port.to_string().into(),
            "-o".into(),
            format!("ServerAliveInterval={}", self.keepalive_interval_seconds).into(),
            "-o".into(),
            format!(
                "ExitOnForwardFailure={}",
                if self.exit_on_forward_failure {
                    "yes"
                } else {
                    "no"
                }
            )
            .into(),
        ];
        args.push(self.destination().into());
        args
    }
}

fn invalid(message: impl Into<String>) -> TunnelError {
    TunnelError::Validation(message.into())
}

/// Validate a connection name
fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(invalid("name is required"));
    }
    if name.trim() != name {
        return Err(invalid(format!(
            "name '{}' must not have leading or trailing whitespace",
            name
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("name must not contain control characters"));
    }
    Ok(())
}

/// Partial update of a [`ConnectionSpec`]; absent fields are left unchanged
///
/// An empty `remote_user` clears the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionUpdate {
    pub name: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub credential_path: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub keepalive_interval_seconds: Option<u32>,
    pub exit_on_forward_failure: Option<bool>,
}

impl ConnectionUpdate {
    /// Produce the merged spec; the result still needs validation
    pub fn apply(&self, base: &ConnectionSpec) -> ConnectionSpec {
        let mut spec = base.clone();
        if let Some(name) = &self.name {
            spec.name = name.clone();
        }
        if let Some(port) = self.local_port {
            spec.local_port = port;
        }
        if let Some(port) = self.remote_port {
            spec.remote_port = port;
        }
        if let Some(host) = &self.remote_host {
            spec.remote_host = host.clone();
        }
        if let Some(user) = &self.remote_user {
            spec.remote_user = if user.is_empty() {
                None
            } else {
                Some(user.clone())
            };
        }
        if let Some(path) = &self.credential_path {
            spec.credential_path = path.clone();
        }
        if let Some(port) = self.ssh_port {
            spec.ssh_port = port;
        }
        if let Some(interval) = self.keepalive_interval_seconds {
            spec.keepalive_interval_seconds = interval;
        }
        if let Some(exit) = self.exit_on_forward_failure {
            spec.exit_on_forward_failure = exit;
        }
        spec
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Point-in-time view of a connection
///
/// `active` comes from a live process probe, never from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(flatten)]
    pub spec: ConnectionSpec,
    pub active: bool,
}
