use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),
    /// The pending buffer's backing store could not be reached or refused an operation
    #[error("Metric buffer error: {0}")]
    BufferError(String),
    /// An observation that can never be applied to its row
    #[error("Invalid value {value} for metric '{name}': values must not be negative")]
    InvalidValue { name: String, value: i64 },
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Failures turning an encoded identity key back into a metric.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed identity key: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid date {year}-{month}-{day}")]
    InvalidDate { year: i32, month: u32, day: u32 },
    #[error("invalid hour {0}")]
    InvalidHour(u32),
    #[error("measurable reference needs both a type and an id")]
    IncompleteMeasurable,
}

impl MetricsError {
    pub fn buffer(err: impl std::fmt::Display) -> Self {
        MetricsError::BufferError(err.to_string())
    }

    /// Reject observations the non-negative row accumulator could never take.
    pub fn check_value(name: &str, value: i64) -> Result<(), MetricsError> {
        if value < 0 {
            return Err(MetricsError::InvalidValue {
                name: name.to_string(),
                value,
            });
        }
        Ok(())
    }
}
