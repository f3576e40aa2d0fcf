use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EntraflowError, Result};
use crate::workflow::{BackoffPolicy, WorkflowDefinition, WorkflowFile};

/// Top-level EntraFlow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub state: StateConfig,
    /// JSONL run-event logging.
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Inline workflow definitions.
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
    /// Extra standalone workflow files (`[workflow]` tables), relative to the
    /// config file.
    #[serde(default)]
    pub workflow_files: Vec<String>,
    /// Directory of the loaded config file, for resolving relative paths.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Scheduler defaults applied to nodes that leave a policy unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of nodes executing at once within one run.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Per-attempt timeout for nodes without `timeout_ms`.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Attempts for nodes without `max_retries`.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Backoff for nodes without `backoff`.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn default_max_parallelism() -> usize { 4 }
fn default_timeout_secs() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }

/// Where run snapshots are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// SQLite database path. Default: ~/.entraflow/state.db
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String { "~/.entraflow/state.db".to_string() }

/// JSONL run-event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run-event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.entraflow/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EntraflowError::ConfigNotFound(path.display().to_string()))?;

        let mut config = Self::from_toml(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse config from a TOML string, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| EntraflowError::Config(e.to_string()))
    }

    /// Resolve the state database path (expand ~).
    pub fn state_db_path(&self) -> PathBuf {
        expand_home(&self.state.db_path)
    }

    /// Resolve the run-log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.entraflow/logs"),
        })
    }

    /// Inline workflows plus those from `workflow_files`.
    ///
    /// Duplicate names are rejected.
    pub fn all_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut workflows = self.workflows.clone();
        for file in &self.workflow_files {
            let path = match &self.base_dir {
                Some(base) if Path::new(file).is_relative() => base.join(file),
                _ => expand_home(file),
            };
            workflows.push(WorkflowFile::from_file(&path)?.workflow);
        }

        let mut seen = std::collections::HashSet::new();
        for wf in &workflows {
            if !seen.insert(wf.name.as_str()) {
                return Err(EntraflowError::Config(format!(
                    "Duplicate workflow name: {}",
                    wf.name
                )));
            }
        }
        Ok(workflows)
    }

    /// Find a workflow by name.
    pub fn find_workflow(&self, name: &str) -> Result<WorkflowDefinition> {
        self.all_workflows()?
            .into_iter()
            .find(|wf| wf.name == name)
            .ok_or_else(|| EntraflowError::WorkflowNotFound(name.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
