//! Staging buffers for metrics awaiting commit.

use std::sync::Mutex;

use crate::error::MetricsError;
use crate::metrics::measurable::{Measurable, MetricData};

/// A FIFO buffer of metrics awaiting commit.
pub trait MetricRepository: Send + Sync {
    /// Stage a metric for the next commit. Fails with
    /// [`MetricsError::InvalidValue`] for a negative value.
    fn add(&self, metric: &dyn Measurable) -> Result<(), MetricsError>;

    /// Every staged metric, oldest first.
    fn all(&self) -> Result<Vec<MetricData>, MetricsError>;

    /// Drop the metrics returned by the last [`all`](Self::all), or everything
    /// if nothing has been read yet. Metrics added after that read are kept.
    fn flush(&self) -> Result<(), MetricsError>;
}

/// In-process buffer. Duplicates are kept as separate entries and merged at commit time.
#[derive(Debug, Default)]
pub struct ArrayMetricRepository {
    state: Mutex<Buffer>,
}

#[derive(Debug, Default)]
struct Buffer {
    metrics: Vec<MetricData>,
    /// Length of the snapshot handed out by the last `all`
    read: Option<usize>,
}

impl ArrayMetricRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricRepository for ArrayMetricRepository {
    fn add(&self, metric: &dyn Measurable) -> Result<(), MetricsError> {
        MetricsError::check_value(metric.name(), metric.value())?;
        self.state().metrics.push(MetricData::from_measurable(metric));
        Ok(())
    }

    fn all(&self) -> Result<Vec<MetricData>, MetricsError> {
        let mut state = self.state();
        state.read = Some(state.metrics.len());
        Ok(state.metrics.clone())
    }

    fn flush(&self) -> Result<(), MetricsError> {
        let mut state = self.state();
        match state.read.take() {
            Some(read) => {
                let read = read.min(state.metrics.len());
                state.metrics.drain(..read);
            }
            None => state.metrics.clear(),
        }
        Ok(())
    }
}
