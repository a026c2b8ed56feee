//! Canonical identity keys for grouping metrics.

use chrono::NaiveDate;

use crate::error::{DecodeError, MetricsError};
use crate::metrics::measurable::{Granularity, Identity, Measurable, MeasurableRef, MetricData};

/// Turns the identity of a metric into a string key and back.
pub trait MeasurableEncoder: Send + Sync {
    /// Encode the identity fields of a metric. Never depends on value or metadata.
    fn encode(&self, metric: &dyn Measurable) -> Result<String, MetricsError>;

    /// Rebuild a metric carrying `value` from a key produced by [`encode`](Self::encode).
    fn decode(&self, key: &str, value: i64) -> Result<MetricData, DecodeError>;
}

/// Encodes identities as RFC 8785 canonical JSON.
///
/// Field values are JSON strings, so names or categories containing any
/// separator character cannot collide, and an absent category (`null`) is
/// distinct from an empty one (`""`).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMeasurableEncoder;

impl MeasurableEncoder for JsonMeasurableEncoder {
    fn encode(&self, metric: &dyn Measurable) -> Result<String, MetricsError> {
        let identity = serde_json::to_value(Identity::of(metric))?;
        serde_json_canonicalizer::to_string(&identity)
            .map_err(|e| MetricsError::Generic(format!("Failed to canonicalize identity: {}", e)))
    }

    fn decode(&self, key: &str, value: i64) -> Result<MetricData, DecodeError> {
        let identity: Identity = serde_json::from_str(key)?;

        let date = NaiveDate::from_ymd_opt(identity.year, identity.month, identity.day).ok_or(
            DecodeError::InvalidDate {
                year: identity.year,
                month: identity.month,
                day: identity.day,
            },
        )?;

        let hour = identity.hour.unwrap_or(0);
        let date = date
            .and_hms_opt(hour, 0, 0)
            .ok_or(DecodeError::InvalidHour(hour))?;

        let measurable = match (identity.measurable_type, identity.measurable_id) {
            (Some(kind), Some(id)) => Some(MeasurableRef { kind, id }),
            (None, None) => None,
            _ => return Err(DecodeError::IncompleteMeasurable),
        };

        let granularity = if identity.hour.is_some() {
            Granularity::Hourly
        } else {
            Granularity::Daily
        };

        Ok(MetricData {
            name: identity.name,
            category: identity.category,
            value,
            date,
            granularity,
            measurable,
            metadata: None,
        })
    }
}
