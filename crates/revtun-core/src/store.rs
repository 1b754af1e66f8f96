//! Connection storage
//!
//! Persists the full set of connections as one JSON object keyed by name.
//! Every save replaces the whole file through a temporary sibling and an
//! atomic rename, so a crash mid-write never leaves a truncated store.

use crate::connection::{
    default_exit_on_forward_failure, default_keepalive_interval, default_ssh_port, empty_as_none,
    ConnectionSpec,
};
use crate::error::{Result, TunnelError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// On-disk shape of one connection (the name is the map key)
///
/// Older stores used `vps_ip`, `vps_user`, `key_path`, `alive_interval` and
/// `exit_on_failure`; those names are still accepted when reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredConnection {
    local_port: u16,
    remote_port: u16,
    #[serde(alias = "vps_ip")]
    remote_host: String,
    #[serde(default, alias = "vps_user", deserialize_with = "empty_as_none")]
    remote_user: Option<String>,
    #[serde(alias = "key_path")]
    credential_path: PathBuf,
    #[serde(default = "default_ssh_port")]
    ssh_port: u16,
    #[serde(default = "default_keepalive_interval", alias = "alive_interval")]
    keepalive_interval_seconds: u32,
    #[serde(default = "default_exit_on_forward_failure", alias = "exit_on_failure")]
    exit_on_forward_failure: bool,
}

impl StoredConnection {
    fn into_spec(self, name: String) -> ConnectionSpec {
        ConnectionSpec {
            name,
            local_port: self.local_port,
            remote_port: self.remote_port,
            remote_host: self.remote_host,
            remote_user: self.remote_user,
            credential_path: self.credential_path,
            ssh_port: self.ssh_port,
            keepalive_interval_seconds: self.keepalive_interval_seconds,
            exit_on_forward_failure: self.exit_on_forward_failure,
        }
    }
}

impl From<&ConnectionSpec> for StoredConnection {
    fn from(spec: &ConnectionSpec) -> Self {
        Self {
            local_port: spec.local_port,
            remote_port: spec.remote_port,
            remote_host: spec.remote_host.clone(),
            remote_user: spec.remote_user.clone(),
            credential_path: spec.credential_path.clone(),
            ssh_port: spec.ssh_port,
            keepalive_interval_seconds: spec.keepalive_interval_seconds,
            exit_on_forward_failure: spec.exit_on_forward_failure,
        }
    }
}

/// Durable store for connection settings
#[derive(Debug, Clone)]
pub struct ConnectionStore {
    path: PathBuf,
}

impl ConnectionStore {
    /// Create a store backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all connections
    ///
    /// A missing file yields an empty set. Unreadable or malformed content is
    /// logged and also yields an empty set, so a corrupt store never prevents
    /// startup. Entries with invalid fields are skipped individually.
    pub fn load(&self) -> Vec<ConnectionSpec> {
        if !self.path.exists() {
            debug!("No connection store at {:?}, starting empty", self.path);
            return Vec::new();
        }

        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to read connection store {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        // decode per entry; a bad value skips only its own entry
        let raw: IndexMap<String, serde_json::Value> = match serde_json::from_str(&json) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to parse connection store {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        let mut specs = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let stored: StoredConnection = match serde_json::from_value(value) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("[{}] Skipping stored connection: {}", name, e);
                    continue;
                }
            };

            let spec = stored.into_spec(name);
            if let Err(e) = spec.validate_fields() {
                warn!("[{}] Skipping stored connection: {}", spec.name, e);
                continue;
            }
            specs.push(spec);
        }

        info!("Loaded {} connection(s) from {:?}", specs.len(), self.path);
        specs
    }

    /// Replace the stored set with `specs`
    pub fn save(&self, specs: &[ConnectionSpec]) -> Result<()> {
        let file: IndexMap<&str, StoredConnection> = specs
            .iter()
            .map(|spec| (spec.name.as_str(), StoredConnection::from(spec)))
            .collect();

        let result = serde_json::to_string_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .and_then(|json| self.write_atomic(json.as_bytes()));

        match result {
            Ok(()) => {
                debug!("Saved {} connection(s) to {:?}", specs.len(), self.path);
                Ok(())
            }
            Err(source) => {
                error!("Failed to save connection store {:?}: {}", self.path, source);
                Err(TunnelError::Persistence {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    fn write_atomic(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.tmp_path();
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });

        if let Err(e) = written.and_then(|_| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        Ok(())
    }
}
