use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration.
/// Loaded from ~/.config/remoterun/config.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub runner_type: RunnerType,
    #[serde(default)]
    pub runtime: Option<ContainerRuntime>,
    /// Image used when a run request names none.
    #[serde(default)]
    pub default_image: Option<String>,
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// Base directory for local task artifacts.
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Environment applied to every task, overridden by the request's env.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    Container,
    Local,
}

impl std::fmt::Display for RunnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerType::Container => write!(f, "container"),
            RunnerType::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerRuntime::Docker => write!(f, "docker"),
            ContainerRuntime::Podman => write!(f, "podman"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for execution records and logs.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            list_page_size: default_list_page_size(),
            log_batch_size: default_log_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub runner: Option<String>,
    /// Push endpoint handed to log clients of running executions.
    #[serde(default)]
    pub log_push_endpoint: Option<String>,
    #[serde(default = "default_log_retention_grace_secs")]
    pub log_retention_grace_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            runner: None,
            log_push_endpoint: None,
            log_retention_grace_secs: default_log_retention_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_list_page_size() -> usize {
    100
}

fn default_log_batch_size() -> usize {
    25
}

fn default_log_retention_grace_secs() -> u64 {
    60
}

impl Config {
    /// Load config from the default path (~/.config/remoterun/config.yaml).
    pub fn load_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("remoterun")
            .join("config.yaml")
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for runner in &self.runners {
            if runner.name.trim().is_empty() {
                anyhow::bail!("runner entries need a non-empty name");
            }
            if !seen.insert(runner.name.as_str()) {
                anyhow::bail!("duplicate runner name '{}'", runner.name);
            }
        }
        if self.store.list_page_size == 0 || self.store.log_batch_size == 0 {
            anyhow::bail!("store page and batch sizes must be positive");
        }
        Ok(())
    }

    /// Directory holding execution records and logs.
    pub fn store_dir(&self) -> PathBuf {
        match self.store.dir.as_deref() {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("remoterun"),
        }
    }

    /// Find a runner config by name.
    pub fn find_runner(&self, name: &str) -> Option<&RunnerConfig> {
        self.runners.iter().find(|r| r.name == name)
    }

    /// The runner used when a run request names none: `defaults.runner`,
    /// else the first configured runner.
    pub fn default_runner(&self) -> Option<&RunnerConfig> {
        match self.defaults.runner.as_deref() {
            Some(name) => self.find_runner(name),
            None => self.runners.first(),
        }
    }
}

impl RunnerConfig {
    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime.clone().unwrap_or_default()
    }

    pub fn name_prefix(&self) -> &str {
        self.name_prefix.as_deref().unwrap_or("remoterun")
    }
}
