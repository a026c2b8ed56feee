//! Units of work that move metrics into the database.
//!
//! Jobs are plain serde values so the same job can run inline on the calling
//! thread or travel through a [`JobQueue`] to a worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MetricsError;
use crate::metrics::db::{Metric, MetricsDatabase};
use crate::metrics::encoder::MeasurableEncoder;
use crate::metrics::measurable::{Identity, Measurable, Metadata, MetricData, merge_metadata};
use crate::metrics::queue::JobQueue;

/// Where deferred jobs are pushed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueTarget {
    pub queue: String,
    #[serde(default)]
    pub connection: Option<String>,
}

impl QueueTarget {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            connection: None,
        }
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }
}

impl std::fmt::Display for QueueTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.connection {
            Some(connection) => write!(f, "{}/{}", connection, self.queue),
            None => write!(f, "{}", self.queue),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Sum observations sharing one identity into their row.
    RecordMetric { metrics: Vec<MetricData> },
    /// Group a drained buffer by identity and record each group.
    CommitMetrics {
        metrics: Vec<MetricData>,
        #[serde(default)]
        queue: Option<QueueTarget>,
    },
}

impl Job {
    pub fn record(metric: &dyn Measurable) -> Self {
        Job::RecordMetric {
            metrics: vec![MetricData::from_measurable(metric)],
        }
    }

    pub fn commit(metrics: Vec<MetricData>, queue: Option<QueueTarget>) -> Self {
        Job::CommitMetrics { metrics, queue }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Job::RecordMetric { .. } => "record_metric",
            Job::CommitMetrics { .. } => "commit_metrics",
        }
    }

    pub fn to_json(&self) -> Result<String, MetricsError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self, MetricsError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Run the job. Only `RecordMetric` yields a row.
    pub fn handle(&self, ctx: &JobContext) -> Result<Option<Metric>, MetricsError> {
        match self {
            Job::RecordMetric { metrics } => record_metrics(&ctx.db, metrics),
            Job::CommitMetrics { metrics, queue } => {
                commit_metrics(ctx, metrics, queue.as_ref())?;
                Ok(None)
            }
        }
    }
}

/// What a job needs to run.
#[derive(Clone)]
pub struct JobContext {
    pub db: Arc<MetricsDatabase>,
    pub encoder: Arc<dyn MeasurableEncoder>,
    /// Present when running inside a worker; lets a commit fan out its groups.
    pub queue: Option<Arc<JobQueue>>,
}

impl JobContext {
    pub fn new(db: Arc<MetricsDatabase>, encoder: Arc<dyn MeasurableEncoder>) -> Self {
        Self {
            db,
            encoder,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }
}

/// Add the summed value of `metrics` to the row of their shared identity.
///
/// The identity is taken from the first metric; callers group by identity
/// first. Metadata is merged in input order. Returns `None` for empty input.
pub fn record_metrics(
    db: &MetricsDatabase,
    metrics: &[MetricData],
) -> Result<Option<Metric>, MetricsError> {
    let Some((identity, total, metadata)) = fold_group(metrics)? else {
        return Ok(None);
    };

    debug!(name = %identity.name, count = metrics.len(), total, "recording metric group");
    db.record(&identity, total, metadata.as_ref()).map(Some)
}

/// Group `metrics` by encoded identity and record every group.
///
/// When both a queue target and a queue are available each group is pushed as
/// its own `RecordMetric` job instead of being recorded here. Inline, every
/// group is applied in one transaction, so a failure leaves the database
/// untouched and the commit can be retried as a whole. Returns the number of
/// groups.
pub fn commit_metrics(
    ctx: &JobContext,
    metrics: &[MetricData],
    target: Option<&QueueTarget>,
) -> Result<usize, MetricsError> {
    let mut groups: BTreeMap<String, Vec<MetricData>> = BTreeMap::new();
    for metric in metrics {
        let key = ctx.encoder.encode(metric)?;
        groups.entry(key).or_default().push(metric.clone());
    }

    let count = groups.len();
    match (target, &ctx.queue) {
        (Some(target), Some(queue)) => {
            let jobs: Vec<Job> = groups
                .into_values()
                .map(|metrics| Job::RecordMetric { metrics })
                .collect();
            for job in &jobs {
                queue.push(target, job)?;
            }
        }
        _ => {
            let mut rows = Vec::with_capacity(count);
            for group in groups.values() {
                rows.extend(fold_group(group)?);
            }
            ctx.db.record_batch(&rows)?;
        }
    }

    debug!(metrics = metrics.len(), groups = count, "committed metric batch");
    Ok(count)
}

/// Identity, summed value and merged metadata of one group.
fn fold_group(
    metrics: &[MetricData],
) -> Result<Option<(Identity, i64, Option<Metadata>)>, MetricsError> {
    let Some(first) = metrics.first() else {
        return Ok(None);
    };

    let identity = Identity::of(first);
    let total = metrics.iter().try_fold(0i64, |total, metric| {
        total.checked_add(metric.value).ok_or_else(|| {
            MetricsError::Generic(format!("value overflow while summing '{}'", identity.name))
        })
    })?;
    MetricsError::check_value(&identity.name, total)?;

    let metadata = metrics
        .iter()
        .fold(None, |merged, metric| merge_metadata(merged, metric.metadata.as_ref()));

    Ok(Some((identity, total, metadata)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::encoder::JsonMeasurableEncoder;
    use crate::metrics::query::MetricQuery;
    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn context() -> JobContext {
        JobContext::new(
            Arc::new(MetricsDatabase::open_in_memory().unwrap()),
            Arc::new(JsonMeasurableEncoder),
        )
    }

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    fn views(value: i64) -> MetricData {
        MetricData::new("page_views")
            .with_date(at(2025, 10, 12, 9))
            .with_value(value)
    }

    #[test]
    fn test_record_sums_group() {
        let ctx = context();
        let metric = record_metrics(&ctx.db, &[views(5), views(3), views(2)])
            .unwrap()
            .unwrap();

        assert_eq!(metric.value, 10);
        assert_eq!(ctx.db.count(&MetricQuery::new()).unwrap(), 1);
    }

    #[test]
    fn test_record_empty_is_noop() {
        let ctx = context();
        assert!(record_metrics(&ctx.db, &[]).unwrap().is_none());
        assert_eq!(ctx.db.count(&MetricQuery::new()).unwrap(), 0);
    }

    #[test]
    fn test_record_increments_existing_row() {
        let ctx = context();
        record_metrics(&ctx.db, &[views(4)]).unwrap();
        let metric = record_metrics(&ctx.db, &[views(6)]).unwrap().unwrap();
        assert_eq!(metric.value, 10);
    }

    #[test]
    fn test_record_merges_metadata_in_order() {
        let ctx = context();
        let first = views(1).with_metadata(meta(json!({"a": 1, "b": 1})));
        let second = views(1).with_metadata(meta(json!({"b": 2})));

        let metric = record_metrics(&ctx.db, &[first, views(1), second])
            .unwrap()
            .unwrap();
        assert_eq!(
            metric.metadata.map(serde_json::Value::Object),
            Some(json!({"a": 1, "b": 2}))
        );
    }

    #[test]
    fn test_record_rejects_overflow() {
        let ctx = context();
        let result = record_metrics(&ctx.db, &[views(i64::MAX), views(1)]);
        assert!(matches!(result, Err(MetricsError::Generic(_))));
    }

    #[test]
    fn test_commit_groups_by_identity() {
        let ctx = context();
        let batch = vec![
            views(1),
            views(2).with_category("marketing"),
            views(3),
            views(4).with_category("marketing"),
            views(5).hourly(),
        ];

        let groups = commit_metrics(&ctx, &batch, None).unwrap();

        assert_eq!(groups, 3);
        assert_eq!(ctx.db.sum(&MetricQuery::new()).unwrap(), 15);
        assert_eq!(ctx.db.sum(&MetricQuery::new().category("marketing")).unwrap(), 6);
        assert_eq!(ctx.db.sum(&MetricQuery::new().hourly()).unwrap(), 5);
    }

    #[test]
    fn test_failed_inline_commit_writes_nothing() {
        let ctx = context();
        let batch = vec![
            MetricData::new("a").with_value(1),
            MetricData::new("b").with_value(-5),
            MetricData::new("c").with_value(1),
        ];

        let result = commit_metrics(&ctx, &batch, None);

        assert!(matches!(result, Err(MetricsError::InvalidValue { value: -5, .. })));
        assert_eq!(ctx.db.count(&MetricQuery::new()).unwrap(), 0);

        commit_metrics(&ctx, &batch[..1], None).unwrap();
        assert_eq!(ctx.db.sum(&MetricQuery::new().name("a")).unwrap(), 1);
    }

    #[test]
    fn test_group_may_net_out_non_negative() {
        let ctx = context();
        let metric = record_metrics(&ctx.db, &[views(3), views(-1)]).unwrap().unwrap();
        assert_eq!(metric.value, 2);
    }

    #[test]
    fn test_commit_fans_out_when_queued() {
        let queue = Arc::new(JobQueue::new());
        let ctx = context().with_queue(queue.clone());
        let target = QueueTarget::new("metrics");

        let batch = [views(1), views(1), views(1).with_category("x")];
        let groups = commit_metrics(&ctx, &batch, Some(&target)).unwrap();

        assert_eq!(groups, 2);
        assert_eq!(queue.len(&target), 2);
        assert_eq!(ctx.db.count(&MetricQuery::new()).unwrap(), 0);
    }

    #[test]
    fn test_commit_runs_inline_without_queue() {
        let ctx = context();
        let target = QueueTarget::new("metrics");

        commit_metrics(&ctx, &[views(2)], Some(&target)).unwrap();
        assert_eq!(ctx.db.sum(&MetricQuery::new()).unwrap(), 2);
    }

    #[test]
    fn test_job_serializes_with_tag() {
        let job = Job::commit(vec![views(1)], Some(QueueTarget::new("default")));
        let json: serde_json::Value = serde_json::from_str(&job.to_json().unwrap()).unwrap();

        assert_eq!(json["job"], "commit_metrics");
        assert_eq!(json["queue"]["queue"], "default");
        assert_eq!(Job::from_json(&job.to_json().unwrap()).unwrap(), job);
    }

    #[test]
    fn test_handle_record_returns_row() {
        let ctx = context();
        let metric = Job::record(&views(7)).handle(&ctx).unwrap().unwrap();
        assert_eq!(metric.name, "page_views");
        assert_eq!(metric.value, 7);
    }
}
