//! Validation and dispatch between the HTTP handlers and the storage
//! backend.

use std::sync::Arc;
use telemon_common::error::MetricError;
use telemon_common::types::{Metric, MetricKind};
use telemon_storage::{Result, Storage};

pub struct MetricService {
    storage: Arc<dyn Storage>,
}

impl MetricService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Validates and stores one metric, returning what is stored afterwards.
    pub async fn update(&self, metric: &Metric) -> Result<Metric> {
        metric.validate()?;
        self.storage.write(metric).await
    }

    /// Validates every entry before anything is written, so a malformed
    /// batch never reaches storage.
    pub async fn update_batch(&self, metrics: &[Metric]) -> Result<()> {
        if metrics.is_empty() {
            return Err(MetricError::EmptyBatch.into());
        }
        for metric in metrics {
            metric.validate()?;
        }
        self.storage.write_batch(metrics).await
    }

    pub async fn value(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        self.storage.read(kind, id).await
    }

    /// Every stored metric, gauges and counters together, ordered by id.
    pub async fn all(&self) -> Result<Vec<Metric>> {
        let mut metrics: Vec<Metric> = self.storage.list_gauges().await?.into_values().collect();
        metrics.extend(self.storage.list_counters().await?.into_values());
        metrics.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metrics)
    }

    pub async fn ping(&self) -> Result<()> {
        self.storage.ping().await
    }
}
