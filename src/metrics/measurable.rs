//! The data contract for a single metric observation.

use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata merged into the persisted row on every increment.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Time bucket size of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Daily,
    Hourly,
}

/// Lookup-only reference to an external entity (type tag + primary key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurableRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl MeasurableRef {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn of<S: MetricSubject + ?Sized>(subject: &S) -> Self {
        Self::new(subject.subject_type(), subject.subject_id())
    }
}

/// Implemented by domain entities that metrics can be attributed to.
pub trait MetricSubject {
    fn subject_type(&self) -> String;
    fn subject_id(&self) -> String;
}

/// Anything that can be recorded as a metric.
///
/// Only `name` and `date` are required; the remaining accessors default to an
/// uncategorized daily observation of value 1 with no subject or metadata, so
/// domain types can implement just the parts they carry.
pub trait Measurable {
    fn name(&self) -> &str;

    fn date(&self) -> NaiveDateTime;

    fn category(&self) -> Option<&str> {
        None
    }

    fn value(&self) -> i64 {
        1
    }

    fn granularity(&self) -> Granularity {
        Granularity::Daily
    }

    fn measurable(&self) -> Option<&MeasurableRef> {
        None
    }

    fn metadata(&self) -> Option<&Metadata> {
        None
    }

    fn year(&self) -> i32 {
        self.date().year()
    }

    fn month(&self) -> u32 {
        self.date().month()
    }

    fn day(&self) -> u32 {
        self.date().day()
    }

    /// Hour of day for hourly metrics, `None` for daily buckets.
    fn hour(&self) -> Option<u32> {
        match self.granularity() {
            Granularity::Hourly => Some(self.date().hour()),
            Granularity::Daily => None,
        }
    }
}

/// Plain owned metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    pub value: i64,
    pub date: NaiveDateTime,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub measurable: Option<MeasurableRef>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl MetricData {
    /// A daily observation of value 1, dated now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            value: 1,
            date: Utc::now().naive_utc(),
            granularity: Granularity::Daily,
            measurable: None,
            metadata: None,
        }
    }

    pub fn from_measurable(metric: &dyn Measurable) -> Self {
        Self {
            name: metric.name().to_string(),
            category: metric.category().map(str::to_string),
            value: metric.value(),
            date: metric.date(),
            granularity: metric.granularity(),
            measurable: metric.measurable().cloned(),
            metadata: metric.metadata().cloned(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    pub fn with_date(mut self, date: NaiveDateTime) -> Self {
        self.date = date;
        self
    }

    pub fn hourly(mut self) -> Self {
        self.granularity = Granularity::Hourly;
        self
    }

    pub fn with_measurable(mut self, measurable: MeasurableRef) -> Self {
        self.measurable = Some(measurable);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl Measurable for MetricData {
    fn name(&self) -> &str {
        &self.name
    }

    fn date(&self) -> NaiveDateTime {
        self.date
    }

    fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    fn value(&self) -> i64 {
        self.value
    }

    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn measurable(&self) -> Option<&MeasurableRef> {
        self.measurable.as_ref()
    }

    fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

/// The fields that decide which persisted row an observation lands in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub category: Option<String>,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: Option<u32>,
    pub measurable_type: Option<String>,
    pub measurable_id: Option<String>,
}

impl Identity {
    pub fn of(metric: &dyn Measurable) -> Self {
        let measurable = metric.measurable();
        Self {
            name: metric.name().to_string(),
            category: metric.category().map(str::to_string),
            year: metric.year(),
            month: metric.month(),
            day: metric.day(),
            hour: metric.hour(),
            measurable_type: measurable.map(|m| m.kind.clone()),
            measurable_id: measurable.map(|m| m.id.clone()),
        }
    }
}

/// Shallow merge: keys in `incoming` overwrite keys of the same name in `existing`.
pub fn merge_metadata(existing: Option<Metadata>, incoming: Option<&Metadata>) -> Option<Metadata> {
    match (existing, incoming) {
        (None, None) => None,
        (Some(existing), None) => Some(existing),
        (existing, Some(incoming)) => {
            let mut merged = existing.unwrap_or_default();
            for (key, value) in incoming {
                merged.insert(key.clone(), value.clone());
            }
            Some(merged)
        }
    }
}
