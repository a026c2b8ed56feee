//! Fluent builder for one-off metric observations.

use chrono::NaiveDateTime;

use crate::error::MetricsError;
use crate::metrics::db::Metric;
use crate::metrics::manager::MetricsManager;
use crate::metrics::measurable::{Granularity, MeasurableRef, Metadata, MetricData};

/// Start building a metric observation.
///
/// ```ignore
/// metric("page_views").category("marketing").record(&manager, 1)?;
/// ```
pub fn metric(name: impl Into<String>) -> PendingMetric {
    PendingMetric::new(name)
}

/// A metric observation being described, recorded once a value is known.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMetric {
    name: String,
    category: Option<String>,
    date: Option<NaiveDateTime>,
    granularity: Granularity,
    measurable: Option<MeasurableRef>,
    metadata: Option<Metadata>,
}

impl PendingMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            date: None,
            granularity: Granularity::Daily,
            measurable: None,
            metadata: None,
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Date the observation; defaults to now when recorded.
    pub fn date(mut self, date: NaiveDateTime) -> Self {
        self.date = Some(date);
        self
    }

    pub fn hourly(mut self) -> Self {
        self.granularity = Granularity::Hourly;
        self
    }

    pub fn measurable(mut self, measurable: MeasurableRef) -> Self {
        self.measurable = Some(measurable);
        self
    }

    /// Extra attributes merged into the row's metadata.
    pub fn with(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn to_metric_data(&self, value: i64) -> MetricData {
        let mut data = MetricData::new(self.name.clone()).with_value(value);
        data.category = self.category.clone();
        if let Some(date) = self.date {
            data.date = date;
        }
        data.granularity = self.granularity;
        data.measurable = self.measurable.clone();
        data.metadata = self.metadata.clone();
        data
    }

    pub fn record(
        &self,
        manager: &dyn MetricsManager,
        value: i64,
    ) -> Result<Option<Metric>, MetricsError> {
        manager.record(&self.to_metric_data(value))
    }
}
