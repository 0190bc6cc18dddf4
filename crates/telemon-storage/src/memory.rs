use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use telemon_common::types::{Metric, MetricKind};

use crate::error::{Result, StorageError};
use crate::{MetricMap, Storage};

/// Both metric sets, exactly as they appear in the snapshot file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSets {
    #[serde(default)]
    pub gauges: MetricMap,
    #[serde(default)]
    pub counters: MetricMap,
}

impl MetricSets {
    fn apply(&mut self, metric: &Metric) -> Result<Metric> {
        let (own, other) = match metric.kind {
            MetricKind::Gauge => (&mut self.gauges, &self.counters),
            MetricKind::Counter => (&mut self.counters, &self.gauges),
        };
        if other.contains_key(&metric.id) {
            return Err(StorageError::WrongType {
                id: metric.id.clone(),
                kind: metric.kind,
            });
        }

        let stored = match metric.kind {
            MetricKind::Gauge => metric.clone(),
            MetricKind::Counter => {
                let prior = own.get(&metric.id).and_then(|m| m.delta).unwrap_or(0);
                let delta = metric.delta.unwrap_or(0);
                Metric::counter(metric.id.clone(), prior.saturating_add(delta))
            }
        };
        own.insert(metric.id.clone(), stored.clone());
        Ok(stored)
    }
}

/// In-process backend: one `RwLock` around both maps, optionally mirrored to
/// a JSON snapshot file.
pub struct MemStorage {
    sets: RwLock<MetricSets>,
    snapshot: Option<PathBuf>,
    sync_persist: bool,
    // Serializes snapshot writers so the file always ends up with the newest
    // state.
    persist_lock: tokio::sync::Mutex<()>,
    span: tracing::Span,
}

impl MemStorage {
    pub fn new(span: tracing::Span) -> Self {
        Self {
            sets: RwLock::new(MetricSets::default()),
            snapshot: None,
            sync_persist: false,
            persist_lock: tokio::sync::Mutex::new(()),
            span,
        }
    }

    /// A store mirrored to `path`. With `sync_persist` every successful write
    /// is followed by a snapshot; otherwise the owner calls
    /// [`Storage::persist`] on its own schedule.
    pub fn with_snapshot(path: PathBuf, sync_persist: bool, span: tracing::Span) -> Self {
        Self {
            snapshot: Some(path),
            sync_persist,
            ..Self::new(span)
        }
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    fn read_sets(&self) -> RwLockReadGuard<'_, MetricSets> {
        self.sets.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_sets(&self) -> RwLockWriteGuard<'_, MetricSets> {
        self.sets.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_checked(&self, metric: &Metric, expected: MetricKind) -> Result<Metric> {
        if metric.kind != expected {
            return Err(StorageError::WrongType {
                id: metric.id.clone(),
                kind: expected,
            });
        }
        metric.validate()?;
        self.write_sets().apply(metric)
    }

    async fn after_write(&self) -> Result<()> {
        if self.sync_persist {
            self.persist().await?;
        }
        Ok(())
    }

    async fn write_kind(&self, metric: &Metric, expected: MetricKind) -> Result<Metric> {
        let stored = self.apply_checked(metric, expected)?;
        self.after_write().await?;
        Ok(stored)
    }

    fn read_kind(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        let sets = self.read_sets();
        let map = match kind {
            MetricKind::Gauge => &sets.gauges,
            MetricKind::Counter => &sets.counters,
        };
        map.get(id).cloned().ok_or_else(|| StorageError::NotFound {
            kind,
            id: id.to_string(),
        })
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[async_trait]
impl Storage for MemStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn write_gauge(&self, metric: &Metric) -> Result<Metric> {
        self.write_kind(metric, MetricKind::Gauge).await
    }

    async fn write_counter(&self, metric: &Metric) -> Result<Metric> {
        self.write_kind(metric, MetricKind::Counter).await
    }

    async fn write_batch(&self, metrics: &[Metric]) -> Result<()> {
        let mut outcome = Ok(());
        let mut applied = 0usize;
        for metric in metrics {
            if let Err(e) = self.apply_checked(metric, metric.kind) {
                outcome = Err(e);
                break;
            }
            applied += 1;
        }
        if applied > 0 {
            self.after_write().await?;
        }
        tracing::debug!(parent: &self.span, applied, total = metrics.len(), "Batch applied");
        outcome
    }

    async fn read_gauge(&self, id: &str) -> Result<Metric> {
        self.read_kind(MetricKind::Gauge, id)
    }

    async fn read_counter(&self, id: &str) -> Result<Metric> {
        self.read_kind(MetricKind::Counter, id)
    }

    async fn list_gauges(&self) -> Result<MetricMap> {
        Ok(self.read_sets().gauges.clone())
    }

    async fn list_counters(&self) -> Result<MetricMap> {
        Ok(self.read_sets().counters.clone())
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = self.snapshot.as_deref() else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let (data, gauges, counters) = {
            let sets = self.read_sets();
            (
                serde_json::to_vec_pretty(&*sets)?,
                sets.gauges.len(),
                sets.counters.len(),
            )
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;

        tracing::debug!(
            parent: &self.span,
            path = %path.display(),
            gauges,
            counters,
            "Snapshot written"
        );
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        let Some(path) = self.snapshot.as_deref() else {
            return Ok(());
        };
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(parent: &self.span, path = %path.display(), "No snapshot to restore");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let restored: MetricSets = serde_json::from_slice(&data)?;
        tracing::info!(
            parent: &self.span,
            path = %path.display(),
            gauges = restored.gauges.len(),
            counters = restored.counters.len(),
            "Snapshot restored"
        );
        *self.write_sets() = restored;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
