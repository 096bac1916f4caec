use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use statline_sync::{CoordinatorConfig, RetryPolicy};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_SOURCE_URL: &str = "ws://127.0.0.1:8765/sync";
pub const CONFIG_ENV: &str = "STATLINE_CONFIG";
pub const SOURCE_URL_ENV: &str = "STATLINE_SOURCE_URL";
pub const STORE_DIR_ENV: &str = "STATLINE_STORE_DIR";

/// `config.toml` contents. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatlineConfig {
    pub source_url: String,
    pub store_dir: Option<PathBuf>,
    pub idle_timeout_secs: u64,
    pub absolute_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub batch_size_hint: u32,
    pub retry_attempts: u32,
    pub retry_backoff_secs: u64,
}

impl Default for StatlineConfig {
    fn default() -> Self {
        let coordinator = CoordinatorConfig::default();
        let retry = RetryPolicy::default();
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            store_dir: None,
            idle_timeout_secs: coordinator.idle_timeout.as_secs(),
            absolute_timeout_secs: coordinator.absolute_timeout.as_secs(),
            cache_ttl_secs: statline_storage::cache::DEFAULT_CACHE_TTL.as_secs(),
            batch_size_hint: coordinator
                .batch_size_hint
                .unwrap_or(statline_sync::coordinator::DEFAULT_BATCH_SIZE_HINT),
            retry_attempts: retry.max_attempts,
            retry_backoff_secs: retry.backoff_step.as_secs(),
        }
    }
}

impl StatlineConfig {
    /// Reads the file at the resolved path (if any) and applies env overrides.
    pub fn load(
        flag_path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = config_path(flag_path, &lookup);
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = non_empty(lookup(SOURCE_URL_ENV)) {
            self.source_url = url;
        }
        if let Some(dir) = non_empty(lookup(STORE_DIR_ENV)) {
            self.store_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn source_url(&self) -> Result<Url> {
        Url::parse(&self.source_url)
            .with_context(|| format!("invalid source url '{}'", self.source_url))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("statline")
        })
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            absolute_timeout: Duration::from_secs(self.absolute_timeout_secs),
            batch_size_hint: (self.batch_size_hint > 0).then_some(self.batch_size_hint),
            ..CoordinatorConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            backoff_step: Duration::from_secs(self.retry_backoff_secs),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn config_path(
    flag_path: Option<&Path>,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    if let Some(path) = flag_path {
        return Some(path.to_path_buf());
    }
    if let Some(path) = non_empty(lookup(CONFIG_ENV)) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("statline").join("config.toml"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
