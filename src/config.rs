//! Coordinator configuration loaded from `~/.concord/concord.toml`.
//!
//! Every section is optional; a missing file yields [`Config::default`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::WorkerId;
use crate::{clog_debug, Error, Result};

/// Default executor timeout (10 minutes).
pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 600;

/// Default age after which a heartbeat is considered stale.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command line of the AI-agent executor; the prompt is appended as the last argument.
    pub command: String,
    pub timeout_secs: u64,
    /// Time between SIGTERM and a forced kill.
    pub grace_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "claude -p --output-format json".to_string(),
            timeout_secs: DEFAULT_EXECUTOR_TIMEOUT_SECS,
            grace_secs: 5,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub tick_millis: u64,
    pub manager_interval_secs: u64,
    pub stale_after_secs: u64,
    pub stall_after_secs: u64,
    pub max_retries: u32,
    pub history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_millis: 500,
            manager_interval_secs: 5,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            stall_after_secs: DEFAULT_STALE_AFTER_SECS,
            max_retries: 2,
            history_limit: 200,
        }
    }
}

impl CoordinatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }

    pub fn manager_interval(&self) -> Duration {
        Duration::from_secs(self.manager_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn stall_after(&self) -> Duration {
        Duration::from_secs(self.stall_after_secs)
    }
}

/// The responsibility a worker holds for routing injected work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Models, services, APIs, backend.
    Architecture,
    /// Views, components, UI.
    Interface,
    /// READMEs and docs.
    Documentation,
    /// Tests and verification.
    Quality,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Architecture => write!(f, "architecture"),
            WorkerRole::Interface => write!(f, "interface"),
            WorkerRole::Documentation => write!(f, "documentation"),
            WorkerRole::Quality => write!(f, "quality"),
        }
    }
}

/// Static role → worker assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleMap {
    pub architecture: WorkerId,
    pub interface: WorkerId,
    pub documentation: WorkerId,
    pub quality: WorkerId,
}

impl Default for RoleMap {
    fn default() -> Self {
        Self {
            architecture: "T2".to_string(),
            interface: "T1".to_string(),
            documentation: "T3".to_string(),
            quality: "T5".to_string(),
        }
    }
}

impl RoleMap {
    pub fn worker_for(&self, role: WorkerRole) -> &str {
        match role {
            WorkerRole::Architecture => &self.architecture,
            WorkerRole::Interface => &self.interface,
            WorkerRole::Documentation => &self.documentation,
            WorkerRole::Quality => &self.quality,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub state_dir: Option<String>,
    pub workers: Vec<WorkerId>,
    pub executor: ExecutorConfig,
    pub coordinator: CoordinatorConfig,
    pub roles: RoleMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            workers: ["T1", "T2", "T3", "T4", "T5"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            executor: ExecutorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            roles: RoleMap::default(),
        }
    }
}

impl Config {
    pub fn concord_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".concord"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::concord_dir()?.join("concord.toml"))
    }

    /// Directory holding tasks, contracts and heartbeats.
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::concord_dir()?.join("state")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: workers={:?}, executor={:?}, state_dir={:?}",
            config.workers,
            config.executor.command,
            config.state_dir
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(Error::Validation("at least one worker is required".into()));
        }
        if self.executor.command.split_whitespace().next().is_none() {
            return Err(Error::Validation("executor command is empty".into()));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
