//! Wires configured strategies into a ready-to-use manager.

use std::sync::Arc;

use tracing::debug;

use crate::config::{BufferDriver, Config};
use crate::error::MetricsError;
use crate::metrics::{
    ArrayMetricRepository, DatabaseMetricsManager, Dispatcher, JobContext, JobQueue,
    JsonMeasurableEncoder, MeasurableEncoder, MetricRepository, MetricsDatabase, MetricsManager,
    QueueDispatcher, SharedMetricRepository, SqliteRemoteStore, SyncDispatcher, Worker,
};

/// Everything a process needs to record and commit metrics.
pub struct MetricsRuntime {
    pub config: Config,
    pub db: Arc<MetricsDatabase>,
    pub manager: Arc<DatabaseMetricsManager>,
    /// Present when jobs are deferred
    pub queue: Option<Arc<JobQueue>>,
    encoder: Arc<dyn MeasurableEncoder>,
}

impl MetricsRuntime {
    pub fn from_config(config: Config) -> Result<Self, MetricsError> {
        let db = Arc::new(MetricsDatabase::open(&config.database)?);
        let encoder: Arc<dyn MeasurableEncoder> = Arc::new(JsonMeasurableEncoder);
        let ctx = JobContext::new(db.clone(), encoder.clone());

        let repository: Arc<dyn MetricRepository> = match config.buffer {
            BufferDriver::Array => Arc::new(ArrayMetricRepository::new()),
            BufferDriver::Shared => {
                let store = Arc::new(SqliteRemoteStore::open(&config.buffer_connection)?);
                Arc::new(SharedMetricRepository::new(
                    store,
                    config.buffer_key.clone(),
                    encoder.clone(),
                ))
            }
        };

        let queue = config.queue.then(|| Arc::new(JobQueue::new()));
        let dispatcher: Arc<dyn Dispatcher> = match &queue {
            Some(queue) => Arc::new(QueueDispatcher::new(queue.clone(), config.queue_target())),
            None => Arc::new(SyncDispatcher::new(ctx)),
        };

        debug!(
            database = %config.database.display(),
            buffer = ?config.buffer,
            deferred = config.queue,
            "metrics runtime ready"
        );

        let manager = Arc::new(
            DatabaseMetricsManager::new(repository, dispatcher)
                .with_auto_commit(config.auto_commit),
        );

        Ok(Self {
            config,
            db,
            manager,
            queue,
            encoder,
        })
    }

    pub fn load() -> Result<Self, MetricsError> {
        Self::from_config(Config::load()?)
    }

    /// Worker for the configured queue, or `None` when jobs run inline.
    pub fn worker(&self) -> Option<Worker> {
        let queue = self.queue.clone()?;
        let ctx = JobContext::new(self.db.clone(), self.encoder.clone());
        let worker = Worker::new(queue, self.config.queue_target(), ctx)
            .concurrency(self.config.worker_concurrency)
            .max_attempts(self.config.worker_tries);

        if self.config.auto_commit {
            let manager: Arc<dyn MetricsManager> = self.manager.clone();
            Some(worker.auto_commit(manager))
        } else {
            Some(worker)
        }
    }

    /// Run queued jobs to completion. A no-op when jobs run inline.
    pub fn drain(&self) {
        if let Some(worker) = self.worker() {
            worker.run_until_empty();
        }
    }

    /// End of a unit of work: auto-commit the buffer and run whatever that queued.
    pub fn finish(&self) -> Result<usize, MetricsError> {
        let committed = self.manager.terminate()?;
        self.drain();
        Ok(committed)
    }
}
