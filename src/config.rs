use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const DEFAULT_PROJECT_NAME: &str = "Untitled Project";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_review_iterations: u32,
    pub min_review_rounds: u32,
    pub max_concurrent_tasks: usize,
    pub fail_on_review_rejection: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_review_iterations: 3,
            min_review_rounds: 1,
            max_concurrent_tasks: 4,
            fail_on_review_rejection: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub stuck_threshold_secs: u64,
    pub overdue_threshold_secs: u64,
    pub check_interval_secs: u64,
    /// Reassignments of one task before it is failed instead.
    pub max_retries: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            stuck_threshold_secs: 300,
            overdue_threshold_secs: 3600,
            check_interval_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project_name: String,
    pub workflow: WorkflowConfig,
    pub health: HealthSettings,
    pub state_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            workflow: WorkflowConfig::default(),
            health: HealthSettings::default(),
            state_path: None,
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Where the run snapshot is persisted.
    pub fn snapshot_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::conductor_dir()?.join("snapshot.json")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tracing::debug!(
            project = %config.project_name,
            max_review_iterations = config.workflow.max_review_iterations,
            min_review_rounds = config.workflow.min_review_rounds,
            stuck_threshold_secs = config.health.stuck_threshold_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "creating conductor directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
