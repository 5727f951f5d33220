use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{AgentProfile, ProfileRegistry, SchedulerConfig};
use crate::{slog_debug, Error, Result};

const CONFIG_FILE: &str = "swarm.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSettings {
    pub name: String,
    pub max_concurrent: usize,
    pub budget_usd: f64,
    pub max_retries: u32,
    pub task_budget_usd: f64,
    pub poll_interval_ms: u64,
    pub stall_polls: u32,
    /// Decomposition model recorded in plans.
    pub model: String,
    /// Executor command, looked up on the PATH.
    pub command: String,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 4,
            budget_usd: 5.0,
            max_retries: 0,
            task_budget_usd: 0.5,
            poll_interval_ms: 500,
            stall_polls: 3,
            model: "opus".to_string(),
            command: "claude".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub swarm: SwarmSettings,
    /// Agent profiles keyed by `agent_type`.
    #[serde(default)]
    pub agents: HashMap<String, AgentProfile>,
}

impl Config {
    pub fn swarm_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".swarm"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join(CONFIG_FILE))
    }

    /// Config file locations in lookup order, for a given working directory.
    pub fn search_paths(cwd: &Path) -> Vec<PathBuf> {
        let mut paths = vec![
            cwd.join(CONFIG_FILE),
            cwd.join(".swarm").join(CONFIG_FILE),
        ];
        if let Ok(global) = Self::config_path() {
            paths.push(global);
        }
        paths
    }

    /// First existing config file for `cwd`, if any.
    pub fn find(cwd: &Path) -> Option<PathBuf> {
        Self::search_paths(cwd).into_iter().find(|p| p.is_file())
    }

    /// Load the explicit file if given, else the first file found from
    /// `cwd`, else defaults.
    ///
    /// # Errors
    /// An explicit path that does not exist is an error; so is a file that
    /// is not valid TOML.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => match Self::find(cwd) {
                Some(path) => Self::load_from(&path),
                None => {
                    slog_debug!("No config file found from {}, using defaults", cwd.display());
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        slog_debug!("Config::load_from path={}", path.display());
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        slog_debug!(
            "Config loaded: name={}, max_concurrent={}, budget={}, retries={}, agents={}",
            config.swarm.name,
            config.swarm.max_concurrent,
            config.swarm.budget_usd,
            config.swarm.max_retries,
            config.agents.len()
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                slog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        slog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Scheduler limits for a run in `cwd`.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if the limits are out of range.
    pub fn scheduler_config(&self, cwd: &Path) -> Result<SchedulerConfig> {
        let config = SchedulerConfig {
            max_concurrent: self.swarm.max_concurrent,
            budget: self.swarm.budget_usd,
            max_retries: self.swarm.max_retries,
            task_budget: self.swarm.task_budget_usd,
            poll_interval: Duration::from_millis(self.swarm.poll_interval_ms),
            stall_polls: self.swarm.stall_polls,
            cwd: cwd.to_path_buf(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn profiles(&self) -> ProfileRegistry {
        ProfileRegistry::new(self.agents.clone())
    }
}
