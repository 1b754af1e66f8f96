//! Daemon configuration management
//!
//! Settings live in `<data_dir>/config.json`; the data directory defaults to
//! `~/.revtun` and also holds the connection store and the daemon socket.

use anyhow::{Context, Result};
use revtun_core::supervisor::DEFAULT_SSH_PROGRAM;
use revtun_core::{SupervisorConfig, DEFAULT_STOP_GRACE, DEFAULT_TICK_INTERVAL};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Connection store; defaults to `<data_dir>/connections.json`
    pub store_path: Option<PathBuf>,
    /// Program and leading arguments used to launch ssh
    pub ssh_command: Vec<String>,
    /// Seconds between reconciliation passes
    pub tick_interval_secs: u64,
    /// Seconds a tunnel gets to exit after SIGTERM
    pub stop_grace_secs: u64,
    /// Start every stored connection when the daemon boots
    pub autostart: bool,
    /// Consecutive automatic restarts before giving up (unbounded if unset)
    pub max_restart_attempts: Option<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            ssh_command: vec![DEFAULT_SSH_PROGRAM.to_string()],
            tick_interval_secs: DEFAULT_TICK_INTERVAL.as_secs(),
            stop_grace_secs: DEFAULT_STOP_GRACE.as_secs(),
            autostart: false,
            max_restart_attempts: None,
        }
    }
}

impl DaemonConfig {
    /// Supervisor settings derived from this configuration
    pub fn supervisor_config(&self) -> Result<SupervisorConfig> {
        let (program, args) = self
            .ssh_command
            .split_first()
            .context("ssh_command must name a program")?;

        Ok(SupervisorConfig {
            ssh_program: PathBuf::from(program),
            ssh_program_args: args.iter().map(OsString::from).collect(),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Locates and edits the files under the data directory
#[derive(Debug, Clone)]
pub struct ConfigManager {
    data_dir: PathBuf,
}

impl ConfigManager {
    /// Use `data_dir`, or `~/.revtun` when not given
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => Self::default_data_dir()?,
        };
        Ok(Self { data_dir })
    }

    fn default_data_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".revtun"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("daemon.sock")
    }

    /// Effective connection store path for `config`
    pub fn store_path(&self, config: &DaemonConfig) -> PathBuf {
        config
            .store_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("connections.json"))
    }

    /// Load the configuration, falling back to defaults if the file is absent
    pub fn load(&self) -> Result<DaemonConfig> {
        let path = self.config_path();

        if !path.exists() {
            return Ok(DaemonConfig::default());
        }

        let json =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;

        let config: DaemonConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Save the configuration to disk
    pub fn save(&self, config: &DaemonConfig) -> Result<()> {
        fs::create_dir_all(&self.data_dir).context(format!(
            "Failed to create config directory: {:?}",
            self.data_dir
        ))?;

        let path = self.config_path();
        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Load, modify and save in one step
    pub fn update(&self, edit: impl FnOnce(&mut DaemonConfig)) -> Result<DaemonConfig> {
        let mut config = self.load()?;
        edit(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}
