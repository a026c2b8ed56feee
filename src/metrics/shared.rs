//! Pending buffer shared between processes through a [`RemoteStore`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MetricsError;
use crate::metrics::encoder::MeasurableEncoder;
use crate::metrics::measurable::{Measurable, MetricData};
use crate::metrics::remote::RemoteStore;
use crate::metrics::repository::MetricRepository;

pub const DEFAULT_BUFFER_KEY: &str = "metrics:pending";

/// How long a claim may go unflushed before another committer adopts it
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(600);

/// Buffer living under one key of a [`RemoteStore`].
///
/// When the store can increment counters, observations with the same identity
/// are summed remotely and [`all`](MetricRepository::all) returns one entry per
/// identity. Otherwise each observation is appended as a JSON entry.
///
/// Draining moves the live key onto a private claim key first, so observations
/// added by other processes while a commit is in flight land in the live key
/// and are left for the next commit.
///
/// A claim that is never flushed is not lost. Dropping the repository moves it
/// back onto the live key, and a claim whose owner died without dropping is
/// adopted by the next committer once its lease is older than the claim TTL.
pub struct SharedMetricRepository {
    store: Arc<dyn RemoteStore>,
    key: String,
    encoder: Arc<dyn MeasurableEncoder>,
    claim: Mutex<Option<String>>,
    claim_ttl: Duration,
}

impl SharedMetricRepository {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        key: impl Into<String>,
        encoder: Arc<dyn MeasurableEncoder>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            encoder,
            claim: Mutex::new(None),
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn claim_prefix(&self) -> String {
        format!("{}:committing:", self.key)
    }

    fn claim_key(&self) -> String {
        let mut claim = self.claim.lock().unwrap_or_else(|p| p.into_inner());
        claim
            .get_or_insert_with(|| format!("{}{}", self.claim_prefix(), Uuid::new_v4()))
            .clone()
    }

    /// Fold claims abandoned by dead committers into `claim`.
    fn adopt_expired_claims(&self, claim: &str) -> Result<(), MetricsError> {
        for stale in self.store.expired_leases(&self.claim_prefix(), self.claim_ttl)? {
            if stale == claim {
                continue;
            }
            warn!(key = %self.key, stale = %stale, "adopting abandoned metric claim");
            self.store.rename(&stale, claim)?;
        }
        Ok(())
    }

    fn read_counters(&self, claim: &str) -> Result<Vec<MetricData>, MetricsError> {
        let mut metrics = Vec::new();
        for counter in self.store.counters(claim)? {
            match self.encoder.decode(&counter.field, counter.value) {
                Ok(mut metric) => {
                    metric.metadata = counter.metadata;
                    metrics.push(metric);
                }
                Err(e) => {
                    warn!(key = %counter.field, error = %e, "skipping undecodable buffered metric");
                }
            }
        }
        Ok(metrics)
    }

    fn read_list(&self, claim: &str) -> Result<Vec<MetricData>, MetricsError> {
        let mut metrics = Vec::new();
        for entry in self.store.range(claim)? {
            match serde_json::from_str::<MetricData>(&entry) {
                Ok(metric) if metric.value < 0 => {
                    warn!(
                        name = %metric.name,
                        value = metric.value,
                        "skipping negative buffered metric"
                    );
                }
                Ok(metric) => metrics.push(metric),
                Err(e) => {
                    warn!(error = %e, "skipping unparseable buffered metric");
                }
            }
        }
        Ok(metrics)
    }
}

impl MetricRepository for SharedMetricRepository {
    fn add(&self, metric: &dyn Measurable) -> Result<(), MetricsError> {
        MetricsError::check_value(metric.name(), metric.value())?;

        if self.store.supports_increment() {
            let field = self.encoder.encode(metric)?;
            self.store
                .increment(&self.key, &field, metric.value(), metric.metadata())
        } else {
            let entry = serde_json::to_string(&MetricData::from_measurable(metric))?;
            self.store.append(&self.key, &entry)
        }
    }

    fn all(&self) -> Result<Vec<MetricData>, MetricsError> {
        let claim = self.claim_key();
        self.store.lease(&claim)?;
        self.adopt_expired_claims(&claim)?;
        self.store.rename(&self.key, &claim)?;

        let mut metrics = self.read_counters(&claim)?;
        metrics.extend(self.read_list(&claim)?);

        debug!(key = %self.key, claim = %claim, count = metrics.len(), "claimed buffered metrics");
        Ok(metrics)
    }

    fn flush(&self) -> Result<(), MetricsError> {
        let claim = self.claim.lock().unwrap_or_else(|p| p.into_inner()).take();
        match claim {
            Some(claim) => self.store.delete(&claim),
            None => self.store.delete(&self.key),
        }
    }
}

impl Drop for SharedMetricRepository {
    fn drop(&mut self) {
        let claim = self.claim.get_mut().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(claim) = claim {
            // Hand unflushed metrics back to the live buffer
            if let Err(e) = self.store.rename(&claim, &self.key) {
                warn!(
                    key = %self.key,
                    claim = %claim,
                    error = %e,
                    "failed to release metric claim"
                );
            }
        }
    }
}
