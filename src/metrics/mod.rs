//! Metric aggregation.
//!
//! Observations are recorded through a [`MetricsManager`]. Recorded metrics are
//! written straight to the [`MetricsDatabase`], or staged in a
//! [`MetricRepository`] while capturing and merged by identity on commit.

pub mod db;
pub mod encoder;
pub mod jobs;
pub mod manager;
pub mod measurable;
pub mod pending;
pub mod query;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod shared;

pub use db::{Metric, MetricsDatabase};
pub use encoder::{JsonMeasurableEncoder, MeasurableEncoder};
pub use jobs::{Job, JobContext, QueueTarget};
pub use manager::{DatabaseMetricsManager, MetricFake, MetricsManager};
pub use measurable::{
    Granularity, Identity, Measurable, MeasurableRef, Metadata, MetricData, MetricSubject,
};
pub use pending::{PendingMetric, metric};
pub use query::MetricQuery;
pub use queue::{Dispatcher, JobQueue, QueueDispatcher, SyncDispatcher, Worker, WorkerReport};
pub use remote::{RemoteStore, SqliteRemoteStore};
pub use repository::{ArrayMetricRepository, MetricRepository};
pub use shared::SharedMetricRepository;
