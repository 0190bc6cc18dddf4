//! Metric storage for the telemon server and the agent's local cache.
//!
//! Two interchangeable backends implement [`Storage`]:
//!
//! - [`memory::MemStorage`] keeps both metric sets behind one read/write lock
//!   and can snapshot them to a JSON file, either after every write or when
//!   [`Storage::persist`] is called on a timer.
//! - [`relational::DbStorage`] writes every metric straight into a
//!   relational table through SeaORM, so persist/restore are no-ops.
//!
//! Both backends apply the same aggregation rules: gauges overwrite,
//! counters accumulate, and an id never changes kind once written.

pub mod entities;
pub mod error;
pub mod memory;
pub mod relational;


use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use telemon_common::types::{Metric, MetricKind};

pub use error::{Result, StorageError};

/// Metrics of one kind keyed by id.
pub type MetricMap = HashMap<String, Metric>;

/// The storage capability set shared by every backend.
///
/// Implementations must be `Send + Sync`: the server hands one instance to
/// all request handlers, and the agent shares its cache between collection
/// and reporting jobs running on different workers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs (`"memory"`, `"relational"`).
    fn backend(&self) -> &'static str;

    /// Stores a gauge, replacing any previous value. Returns what is now
    /// stored.
    ///
    /// # Errors
    ///
    /// [`StorageError::WrongType`] when `metric` is not a gauge or its id is
    /// already a counter; [`StorageError::Validation`] when `value` is absent.
    async fn write_gauge(&self, metric: &Metric) -> Result<Metric>;

    /// Adds `delta` to the stored counter (missing counts as zero). Returns
    /// the accumulated total.
    async fn write_counter(&self, metric: &Metric) -> Result<Metric>;

    /// Dispatches to [`write_gauge`](Self::write_gauge) or
    /// [`write_counter`](Self::write_counter) by kind.
    async fn write(&self, metric: &Metric) -> Result<Metric> {
        match metric.kind {
            MetricKind::Gauge => self.write_gauge(metric).await,
            MetricKind::Counter => self.write_counter(metric).await,
        }
    }

    /// Applies a batch. The relational backend is all-or-nothing; the
    /// in-memory backend applies entries in order and stops at the first
    /// failure, keeping what was already applied.
    async fn write_batch(&self, metrics: &[Metric]) -> Result<()>;

    async fn read_gauge(&self, id: &str) -> Result<Metric>;

    async fn read_counter(&self, id: &str) -> Result<Metric>;

    async fn read(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        match kind {
            MetricKind::Gauge => self.read_gauge(id).await,
            MetricKind::Counter => self.read_counter(id).await,
        }
    }

    /// Returns a copy of every stored gauge.
    async fn list_gauges(&self) -> Result<MetricMap>;

    /// Returns a copy of every stored counter.
    async fn list_counters(&self) -> Result<MetricMap>;

    /// Writes the current state to durable storage, if the backend keeps one
    /// apart from its working set.
    async fn persist(&self) -> Result<()>;

    /// Replaces the working set with the last persisted state.
    async fn restore(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Releases backend resources. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Backend selection and persistence options.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Selects the relational backend when set.
    pub database_url: Option<String>,
    /// Snapshot file for the in-memory backend.
    pub file_path: Option<PathBuf>,
    /// Persist after every write instead of on a timer.
    pub sync_persist: bool,
    /// Load the snapshot file on open.
    pub restore: bool,
}

/// Opens the backend described by `config`.
///
/// A failed restore is logged and the in-memory backend starts empty.
pub async fn open(config: &StorageConfig, span: tracing::Span) -> Result<Arc<dyn Storage>> {
    if let Some(url) = config.database_url.as_deref().filter(|u| !u.is_empty()) {
        let storage = relational::DbStorage::connect(url, span).await?;
        return Ok(Arc::new(storage));
    }

    let storage = match &config.file_path {
        Some(path) => memory::MemStorage::with_snapshot(path.clone(), config.sync_persist, span),
        None => memory::MemStorage::new(span),
    };
    if config.restore {
        if let Err(e) = storage.restore().await {
            tracing::error!(error = %e, "Failed to restore metrics snapshot, starting empty");
        }
    }
    Ok(Arc::new(storage))
}
