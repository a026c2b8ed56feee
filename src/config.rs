use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::MetricsError;
use crate::metrics::jobs::QueueTarget;
use crate::metrics::queue::{DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};
use crate::metrics::shared::DEFAULT_BUFFER_KEY;

/// Prefix of every environment variable read into [`Config`]
pub const ENV_PREFIX: &str = "METRICS_";

/// Where pending metrics are staged while capturing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferDriver {
    /// In-process list, lost with the process
    #[default]
    Array,
    /// Buffer file shared by every process pointing at it
    Shared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Defer record and commit jobs to a worker instead of running them inline
    pub queue: bool,
    pub queue_name: String,
    pub queue_connection: Option<String>,
    /// Commit the buffer at process boundaries
    pub auto_commit: bool,
    pub buffer: BufferDriver,
    pub buffer_connection: PathBuf,
    pub buffer_key: String,
    pub database: PathBuf,
    pub worker_concurrency: usize,
    pub worker_tries: u32,
}

/// One layer of configuration. Used for both the JSON file and the
/// `METRICS_*` environment, where every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_commit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferDriver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_connection: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_tries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        let dir = tally_dir();
        Config {
            queue: false,
            queue_name: DEFAULT_QUEUE.to_string(),
            queue_connection: None,
            auto_commit: true,
            buffer: BufferDriver::Array,
            buffer_connection: dir.join("buffer-db"),
            buffer_key: DEFAULT_BUFFER_KEY.to_string(),
            database: dir.join("metrics-db"),
            worker_concurrency: DEFAULT_CONCURRENCY,
            worker_tries: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    /// Defaults, overridden by the config file, overridden by the environment.
    pub fn load() -> Result<Config, MetricsError> {
        let file = load_file_config()?;
        let env = envy::prefixed(ENV_PREFIX)
            .from_env::<FileConfig>()
            .map_err(|e| MetricsError::ConfigError(format!("Invalid environment: {}", e)))?;
        Ok(Config::from_sources(file, env))
    }

    pub fn from_sources(file: Option<FileConfig>, env: FileConfig) -> Config {
        let mut config = Config::default();
        if let Some(file) = file {
            config.apply(file);
        }
        config.apply(env);
        config
    }

    fn apply(&mut self, layer: FileConfig) {
        if let Some(queue) = layer.queue {
            self.queue = queue;
        }
        if let Some(name) = layer.queue_name.filter(|s| !s.is_empty()) {
            self.queue_name = name;
        }
        if let Some(connection) = layer.queue_connection.filter(|s| !s.is_empty()) {
            self.queue_connection = Some(connection);
        }
        if let Some(auto_commit) = layer.auto_commit {
            self.auto_commit = auto_commit;
        }
        if let Some(buffer) = layer.buffer {
            self.buffer = buffer;
        }
        if let Some(path) = layer.buffer_connection {
            self.buffer_connection = path;
        }
        if let Some(key) = layer.buffer_key.filter(|s| !s.is_empty()) {
            self.buffer_key = key;
        }
        if let Some(path) = layer.database {
            self.database = path;
        }
        if let Some(concurrency) = layer.worker_concurrency {
            self.worker_concurrency = concurrency.max(1);
        }
        if let Some(tries) = layer.worker_tries {
            self.worker_tries = tries.max(1);
        }
    }

    /// Queue that deferred jobs go to
    pub fn queue_target(&self) -> QueueTarget {
        let target = QueueTarget::new(self.queue_name.clone());
        match &self.queue_connection {
            Some(connection) => target.on_connection(connection.clone()),
            None => target,
        }
    }
}

/// Directory holding the default database, buffer and config file (~/.tally)
pub fn tally_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tally")
}

/// `METRICS_CONFIG` if set, else ~/.tally/config.json
pub fn config_file_path() -> PathBuf {
    match env::var_os("METRICS_CONFIG") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => tally_dir().join("config.json"),
    }
}

/// Read the config file. A missing file is not an error.
pub fn load_file_config() -> Result<Option<FileConfig>, MetricsError> {
    let path = config_file_path();
    if !path.exists() {
        return Ok(None);
    }

    let data = fs::read(&path).map_err(|e| {
        MetricsError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config = serde_json::from_slice::<FileConfig>(&data).map_err(|e| {
        MetricsError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
    })?;
    Ok(Some(config))
}
