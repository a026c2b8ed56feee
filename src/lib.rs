pub mod commands;
pub mod config;
pub mod error;
pub mod metrics;
pub mod runtime;

pub use config::Config;
pub use error::MetricsError;
pub use metrics::{
    DatabaseMetricsManager, Measurable, MetricData, MetricFake, MetricQuery, MetricsManager,
    metric,
};
pub use runtime::MetricsRuntime;
