//! Metric collectors run by the telemon agent.
//!
//! A [`Collector`] samples one category of values and writes them into the
//! agent's local [`Storage`](telemon_storage::Storage) as a side effect. The
//! agent's report job later ships whatever the storage holds.

pub mod runtime;
pub mod system;

use anyhow::Result;
use async_trait::async_trait;

/// A metric source polled on the agent's poll interval.
///
/// Collectors are shared between worker tasks, so implementations must be
/// `Send + Sync` and keep any mutable sampling state behind a lock.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Returns the collector name (e.g. `"runtime"`, `"system"`), used for
    /// logging.
    fn name(&self) -> &str;

    /// Samples current values and writes them to storage.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling fails or storage rejects a write.
    async fn collect(&self) -> Result<()>;
}
