#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

use tally::config::{BufferDriver, Config, FileConfig};
use tally::metrics::MetricsDatabase;
use tally::runtime::MetricsRuntime;

/// Scratch directory holding a metrics database and a shared buffer file.
pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("metrics-db")
    }

    pub fn buffer_path(&self) -> PathBuf {
        self.dir.path().join("buffer-db")
    }

    pub fn config(&self, buffer: BufferDriver, queue: bool) -> Config {
        let mut config = Config::from_sources(None, FileConfig::default());
        config.database = self.database_path();
        config.buffer_connection = self.buffer_path();
        config.buffer = buffer;
        config.queue = queue;
        config
    }

    pub fn runtime(&self, buffer: BufferDriver, queue: bool) -> MetricsRuntime {
        MetricsRuntime::from_config(self.config(buffer, queue)).unwrap()
    }

    /// A fresh connection to the metrics database
    pub fn db(&self) -> MetricsDatabase {
        MetricsDatabase::open(self.database_path()).unwrap()
    }

    /// The `tally` binary, pointed at this environment only.
    pub fn tally(&self) -> Command {
        let mut cmd = Command::cargo_bin("tally").unwrap();
        cmd.env("HOME", self.path())
            .env("METRICS_CONFIG", self.path().join("config.json"))
            .env("METRICS_DATABASE", self.database_path())
            .env("METRICS_BUFFER_CONNECTION", self.buffer_path())
            .env_remove("METRICS_QUEUE")
            .env_remove("METRICS_QUEUE_NAME")
            .env_remove("METRICS_QUEUE_CONNECTION")
            .env_remove("METRICS_AUTO_COMMIT")
            .env_remove("METRICS_BUFFER")
            .env_remove("METRICS_BUFFER_KEY")
            .env_remove("TALLY_LOG");
        cmd
    }
}
