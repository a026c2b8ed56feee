//! Entry point for recording and committing metrics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::MetricsError;
use crate::metrics::db::Metric;
use crate::metrics::jobs::Job;
use crate::metrics::measurable::{Identity, Measurable, MetricData};
use crate::metrics::queue::Dispatcher;
use crate::metrics::repository::MetricRepository;

pub trait MetricsManager: Send + Sync {
    /// Persist a metric now, or stage it when capturing.
    ///
    /// Returns the committed row only when the write ran inline. Negative
    /// values are rejected before anything is written or staged.
    fn record(&self, metric: &dyn Measurable) -> Result<Option<Metric>, MetricsError>;

    /// Commit everything staged. Returns how many distinct metrics were handed off.
    fn commit(&self) -> Result<usize, MetricsError>;

    /// Start staging recorded metrics instead of persisting them.
    fn capture(&self);

    fn is_capturing(&self) -> bool;

    fn stop_capturing(&self);
}

/// Manager writing to the metrics database through a [`Dispatcher`].
///
/// While capturing, recorded metrics go to the repository and reach the
/// database on [`commit`](MetricsManager::commit). With auto-commit on, the
/// buffer is also committed when the manager is dropped.
pub struct DatabaseMetricsManager {
    repository: Arc<dyn MetricRepository>,
    dispatcher: Arc<dyn Dispatcher>,
    capturing: AtomicBool,
    auto_commit: bool,
    commit_lock: Mutex<()>,
}

impl DatabaseMetricsManager {
    pub fn new(repository: Arc<dyn MetricRepository>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            repository,
            dispatcher,
            capturing: AtomicBool::new(false),
            auto_commit: true,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn repository(&self) -> &Arc<dyn MetricRepository> {
        &self.repository
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Commit the buffer if auto-commit is on. Call at process boundaries.
    pub fn terminate(&self) -> Result<usize, MetricsError> {
        if !self.auto_commit {
            return Ok(0);
        }
        self.commit()
    }
}

impl MetricsManager for DatabaseMetricsManager {
    fn record(&self, metric: &dyn Measurable) -> Result<Option<Metric>, MetricsError> {
        MetricsError::check_value(metric.name(), metric.value())?;

        if self.is_capturing() {
            self.repository.add(metric)?;
            debug!(name = metric.name(), "staged metric");
            return Ok(None);
        }

        self.dispatcher.dispatch(Job::record(metric))
    }

    fn commit(&self) -> Result<usize, MetricsError> {
        let _guard = self.commit_lock.lock().unwrap_or_else(|p| p.into_inner());

        let metrics = self.repository.all()?;
        if metrics.is_empty() {
            return Ok(0);
        }

        let count = metrics
            .iter()
            .map(|metric| Identity::of(metric))
            .collect::<HashSet<_>>()
            .len();
        let target = self.dispatcher.target().cloned();
        self.dispatcher.dispatch(Job::commit(metrics, target))?;
        self.repository.flush()?;

        info!(count, deferred = self.dispatcher.is_deferred(), "committed metrics");
        Ok(count)
    }

    fn capture(&self) {
        self.capturing.store(true, Ordering::SeqCst);
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn stop_capturing(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }
}

impl Drop for DatabaseMetricsManager {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(error = %e, "auto-commit on shutdown failed");
        }
    }
}

/// In-memory stand-in for a manager, for asserting what code records.
#[derive(Debug, Default)]
pub struct MetricFake {
    recorded: Mutex<Vec<MetricData>>,
    capturing: AtomicBool,
}

impl MetricFake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<MetricData> {
        self.recorded.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Recorded metrics with the given name
    pub fn recorded_named(&self, name: &str) -> Vec<MetricData> {
        self.recorded()
            .into_iter()
            .filter(|m| m.name == name)
            .collect()
    }

    pub fn assert_recorded(&self, name: &str) {
        assert!(
            !self.recorded_named(name).is_empty(),
            "expected metric '{}' to be recorded",
            name
        );
    }

    pub fn assert_recorded_times(&self, name: &str, times: usize) {
        let actual = self.recorded_named(name).len();
        assert_eq!(
            actual, times,
            "expected metric '{}' to be recorded {} time(s), got {}",
            name, times, actual
        );
    }

    /// Assert the summed value of every observation of `name`.
    pub fn assert_value(&self, name: &str, expected: i64) {
        let actual: i64 = self.recorded_named(name).iter().map(|m| m.value).sum();
        assert_eq!(
            actual, expected,
            "expected metric '{}' to total {}, got {}",
            name, expected, actual
        );
    }

    pub fn assert_not_recorded(&self, name: &str) {
        assert!(
            self.recorded_named(name).is_empty(),
            "expected metric '{}' not to be recorded",
            name
        );
    }

    pub fn assert_nothing_recorded(&self) {
        let recorded = self.recorded();
        assert!(
            recorded.is_empty(),
            "expected no metrics, got {}",
            recorded.len()
        );
    }
}

impl MetricsManager for MetricFake {
    fn record(&self, metric: &dyn Measurable) -> Result<Option<Metric>, MetricsError> {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(MetricData::from_measurable(metric));
        Ok(None)
    }

    fn commit(&self) -> Result<usize, MetricsError> {
        let mut recorded = self.recorded.lock().unwrap_or_else(|p| p.into_inner());
        let count = recorded.len();
        recorded.clear();
        Ok(count)
    }

    fn capture(&self) {
        self.capturing.store(true, Ordering::SeqCst);
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn stop_capturing(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }
}
