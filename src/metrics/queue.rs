//! Inline and deferred job execution.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MetricsError;
use crate::metrics::db::Metric;
use crate::metrics::jobs::{Job, JobContext, QueueTarget};
use crate::metrics::manager::MetricsManager;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Runs jobs now or hands them off for later.
pub trait Dispatcher: Send + Sync {
    /// Inline dispatchers return what the job produced; deferred ones return `None`.
    fn dispatch(&self, job: Job) -> Result<Option<Metric>, MetricsError>;

    fn is_deferred(&self) -> bool;

    /// Queue that deferred jobs land on
    fn target(&self) -> Option<&QueueTarget> {
        None
    }
}

/// Runs every job on the calling thread.
pub struct SyncDispatcher {
    ctx: JobContext,
}

impl SyncDispatcher {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

impl Dispatcher for SyncDispatcher {
    fn dispatch(&self, job: Job) -> Result<Option<Metric>, MetricsError> {
        job.handle(&self.ctx)
    }

    fn is_deferred(&self) -> bool {
        false
    }
}

/// Pushes every job onto a [`JobQueue`] for a [`Worker`] to run.
pub struct QueueDispatcher {
    queue: Arc<JobQueue>,
    target: QueueTarget,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<JobQueue>, target: QueueTarget) -> Self {
        Self { queue, target }
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, job: Job) -> Result<Option<Metric>, MetricsError> {
        self.queue.push(&self.target, &job)?;
        Ok(None)
    }

    fn is_deferred(&self) -> bool {
        true
    }

    fn target(&self) -> Option<&QueueTarget> {
        Some(&self.target)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub target: QueueTarget,
    pub payload: String,
    /// Times the job has been handed to a worker
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: QueuedJob,
    pub error: String,
}

/// In-process FIFO queues of serialized jobs, one per [`QueueTarget`].
///
/// Jobs live only as long as the process. Jobs that exhaust their attempts are
/// parked in a failed list for inspection.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<QueueTarget, VecDeque<QueuedJob>>,
    failed: Vec<FailedJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, target: &QueueTarget, job: &Job) -> Result<Uuid, MetricsError> {
        let payload = job.to_json().map_err(|e| {
            MetricsError::QueueError(format!("Failed to serialize {}: {}", job.name(), e))
        })?;
        let id = Uuid::new_v4();

        self.state()
            .queues
            .entry(target.clone())
            .or_default()
            .push_back(QueuedJob {
                id,
                target: target.clone(),
                payload,
                attempts: 0,
            });

        debug!(job = job.name(), %id, queue = %target, "queued job");
        Ok(id)
    }

    /// Take the oldest job, counting the attempt.
    pub fn pop(&self, target: &QueueTarget) -> Option<QueuedJob> {
        let mut state = self.state();
        let mut job = state.queues.get_mut(target)?.pop_front()?;
        job.attempts += 1;
        Some(job)
    }

    /// Put a job back at the end of its queue.
    pub fn release(&self, job: QueuedJob) {
        self.state()
            .queues
            .entry(job.target.clone())
            .or_default()
            .push_back(job);
    }

    pub fn fail(&self, job: QueuedJob, error: impl Into<String>) {
        self.state().failed.push(FailedJob {
            job,
            error: error.into(),
        });
    }

    pub fn len(&self, target: &QueueTarget) -> usize {
        self.state().queues.get(target).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, target: &QueueTarget) -> bool {
        self.len(target) == 0
    }

    pub fn failed(&self) -> Vec<FailedJob> {
        self.state().failed.clone()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for WorkerReport {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

/// Drains one queue, running up to `concurrency` jobs at a time.
pub struct Worker {
    queue: Arc<JobQueue>,
    target: QueueTarget,
    ctx: JobContext,
    concurrency: usize,
    max_attempts: u32,
    manager: Option<Arc<dyn MetricsManager>>,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>, target: QueueTarget, ctx: JobContext) -> Self {
        let ctx = ctx.with_queue(queue.clone());
        Self {
            queue,
            target,
            ctx,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            manager: None,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Commit `manager`'s buffer at the end of every iteration.
    pub fn auto_commit(mut self, manager: Arc<dyn MetricsManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Run one batch of jobs, then auto-commit if configured.
    pub fn run_once(&self) -> WorkerReport {
        let jobs: Vec<QueuedJob> = (0..self.concurrency)
            .map_while(|_| self.queue.pop(&self.target))
            .collect();

        let results = smol::block_on(async {
            stream::iter(jobs)
                .map(|job| {
                    let ctx = self.ctx.clone();
                    smol::unblock(move || {
                        let outcome = Job::from_json(&job.payload).and_then(|j| j.handle(&ctx));
                        (job, outcome)
                    })
                })
                .buffer_unordered(self.concurrency)
                .collect::<Vec<_>>()
                .await
        });

        let mut report = WorkerReport::default();
        for (job, outcome) in results {
            match outcome {
                Ok(_) => report.processed += 1,
                Err(e) if job.attempts < self.max_attempts => {
                    warn!(
                        id = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "job failed, retrying"
                    );
                    self.queue.release(job);
                    report.retried += 1;
                }
                Err(e) => {
                    warn!(
                        id = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "job failed permanently"
                    );
                    self.queue.fail(job, e.to_string());
                    report.failed += 1;
                }
            }
        }

        if let Some(manager) = &self.manager {
            // Nothing captured during the iteration outlives it.
            if let Err(e) = manager.commit() {
                warn!(error = %e, "auto-commit after worker iteration failed");
            }
        }

        report
    }

    /// Keep running batches until the queue is empty.
    pub fn run_until_empty(&self) -> WorkerReport {
        let mut total = WorkerReport::default();
        loop {
            total += self.run_once();
            if self.queue.is_empty(&self.target) {
                break;
            }
        }
        if total != WorkerReport::default() {
            info!(
                queue = %self.target,
                processed = total.processed,
                retried = total.retried,
                failed = total.failed,
                "worker drained queue"
            );
        }
        total
    }
}
