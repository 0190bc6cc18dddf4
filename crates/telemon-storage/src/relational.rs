use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::{Alias, Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, SqlErr, TransactionTrait,
};
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;
use telemon_common::retry::{retry_with_backoff, BACKOFF};
use telemon_common::types::{Metric, MetricKind};

use crate::entities::metric::{self, Column as MetricCol, Entity as MetricEntity};
use crate::error::{Result, StorageError};
use crate::{MetricMap, Storage};

/// Relational backend (PostgreSQL in production, SQLite for local runs).
///
/// Every write is a single `INSERT ... ON CONFLICT (id, kind) DO UPDATE`
/// statement, so concurrent counter increments never race through a
/// read-modify-write. Operations are retried on connection-level faults
/// following [`BACKOFF`].
pub struct DbStorage {
    db: RwLock<Option<DatabaseConnection>>,
    schedule: Vec<Duration>,
    span: tracing::Span,
}

impl DbStorage {
    /// Connects to `url` and brings the schema up to date.
    pub async fn connect(url: &str, span: tracing::Span) -> Result<Self> {
        let db = retry_with_backoff(&BACKOFF, StorageError::is_transient, move || async move {
            Ok::<_, StorageError>(Database::connect(url).await?)
        })
        .await?;
        Self::from_connection(db, span).await
    }

    pub async fn from_connection(db: DatabaseConnection, span: tracing::Span) -> Result<Self> {
        Migrator::up(&db, None).await?;
        tracing::info!(
            parent: &span,
            backend = ?db.get_database_backend(),
            "Relational metric storage ready"
        );
        Ok(Self {
            db: RwLock::new(Some(db)),
            schedule: BACKOFF.to_vec(),
            span,
        })
    }

    /// Overrides the retry schedule. An empty schedule disables retries.
    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule;
        self
    }

    fn conn(&self) -> Result<DatabaseConnection> {
        self.db
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(StorageError::Closed)
    }

    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.schedule, StorageError::is_transient, op).await
    }

    async fn write_one(&self, metric: &Metric, expected: MetricKind) -> Result<Metric> {
        if metric.kind != expected {
            return Err(StorageError::WrongType {
                id: metric.id.clone(),
                kind: expected,
            });
        }
        metric.validate()?;
        self.with_retries(move || async move {
            let txn = self.conn()?.begin().await?;
            upsert(&txn, metric).await?;
            let stored = find(&txn, metric.kind, &metric.id).await?;
            txn.commit().await?;
            stored.ok_or_else(|| StorageError::NotFound {
                kind: metric.kind,
                id: metric.id.clone(),
            })
        })
        .await
    }

    async fn read_one(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        let found = self
            .with_retries(move || async move { find(&self.conn()?, kind, id).await })
            .await?;
        found.ok_or_else(|| StorageError::NotFound {
            kind,
            id: id.to_string(),
        })
    }

    async fn list(&self, kind: MetricKind) -> Result<MetricMap> {
        let rows = self
            .with_retries(move || async move {
                Ok(MetricEntity::find()
                    .filter(MetricCol::Kind.eq(kind.as_str()))
                    .all(&self.conn()?)
                    .await?)
            })
            .await?;
        rows.into_iter()
            .map(|row| to_metric(row).map(|m| (m.id.clone(), m)))
            .collect()
    }
}

fn to_metric(row: metric::Model) -> Result<Metric> {
    let kind: MetricKind = row.kind.parse()?;
    Ok(match kind {
        MetricKind::Gauge => Metric {
            id: row.id,
            kind,
            delta: None,
            value: row.value,
        },
        MetricKind::Counter => Metric {
            id: row.id,
            kind,
            delta: row.delta,
            value: None,
        },
    })
}

async fn find<C: ConnectionTrait>(conn: &C, kind: MetricKind, id: &str) -> Result<Option<Metric>> {
    MetricEntity::find_by_id((id.to_owned(), kind.as_str().to_owned()))
        .one(conn)
        .await?
        .map(to_metric)
        .transpose()
}

/// Gauges replace `value`; counters add the incoming delta to the stored one.
async fn upsert<C: ConnectionTrait>(conn: &C, m: &Metric) -> Result<()> {
    let row = metric::ActiveModel {
        id: Set(m.id.clone()),
        kind: Set(m.kind.as_str().to_owned()),
        value: Set(m.value),
        delta: Set(m.delta),
    };
    let mut on_conflict = OnConflict::columns([MetricCol::Id, MetricCol::Kind]);
    match m.kind {
        MetricKind::Gauge => on_conflict.update_column(MetricCol::Value),
        MetricKind::Counter => on_conflict.value(
            MetricCol::Delta,
            Expr::col((MetricEntity, MetricCol::Delta))
                .add(Expr::col((Alias::new("excluded"), MetricCol::Delta))),
        ),
    };

    match MetricEntity::insert(row)
        .on_conflict(on_conflict)
        .exec_without_returning(conn)
        .await
    {
        Ok(_) => Ok(()),
        // The id is unique on its own, so this means it is held by the other kind.
        Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            Err(StorageError::WrongType {
                id: m.id.clone(),
                kind: m.kind,
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Storage for DbStorage {
    fn backend(&self) -> &'static str {
        "relational"
    }

    async fn write_gauge(&self, metric: &Metric) -> Result<Metric> {
        self.write_one(metric, MetricKind::Gauge).await
    }

    async fn write_counter(&self, metric: &Metric) -> Result<Metric> {
        self.write_one(metric, MetricKind::Counter).await
    }

    async fn write_batch(&self, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            metric.validate()?;
        }
        // Dropping the transaction on any error rolls the whole batch back.
        self.with_retries(move || async move {
            let txn = self.conn()?.begin().await?;
            for metric in metrics {
                upsert(&txn, metric).await?;
            }
            txn.commit().await?;
            Ok(())
        })
        .await?;
        tracing::debug!(parent: &self.span, count = metrics.len(), "Batch committed");
        Ok(())
    }

    async fn read_gauge(&self, id: &str) -> Result<Metric> {
        self.read_one(MetricKind::Gauge, id).await
    }

    async fn read_counter(&self, id: &str) -> Result<Metric> {
        self.read_one(MetricKind::Counter, id).await
    }

    async fn list_gauges(&self) -> Result<MetricMap> {
        self.list(MetricKind::Gauge).await
    }

    async fn list_counters(&self) -> Result<MetricMap> {
        self.list(MetricKind::Counter).await
    }

    async fn persist(&self) -> Result<()> {
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        Ok(())
    }

    // Not retried: a liveness probe should report the database as it is now.
    async fn ping(&self) -> Result<()> {
        Ok(self.conn()?.ping().await?)
    }

    async fn close(&self) -> Result<()> {
        let taken = self
            .db
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(db) = taken {
            db.close().await?;
            tracing::info!(parent: &self.span, "Relational metric storage closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing::Span;

    async fn setup() -> (TempDir, DbStorage) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("metrics.db").display());
        let storage = DbStorage::connect(&url, Span::none()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn counter_upsert_accumulates() {
        let (_dir, db) = setup().await;
        for _ in 0..3 {
            db.write_counter(&Metric::counter("X", 1)).await.unwrap();
        }
        assert_eq!(db.read_counter("X").await.unwrap().delta, Some(3));
        let stored = db.write_counter(&Metric::counter("X", 5)).await.unwrap();
        assert_eq!(stored.delta, Some(8));
    }

    #[tokio::test]
    async fn gauge_upsert_overwrites() {
        let (_dir, db) = setup().await;
        db.write_gauge(&Metric::gauge("Y", 1.0)).await.unwrap();
        let stored = db.write_gauge(&Metric::gauge("Y", 2.0)).await.unwrap();
        assert_eq!(stored.value, Some(2.0));
        assert_eq!(db.list_gauges().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_kind_for_existing_id_is_wrong_type() {
        let (_dir, db) = setup().await;
        db.write_gauge(&Metric::gauge("X", 1.0)).await.unwrap();
        let err = db.write_counter(&Metric::counter("X", 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::WrongType { .. }), "{err:?}");
        assert!(matches!(
            db.read_counter("X").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let (_dir, db) = setup().await;
        db.write_gauge(&Metric::gauge("taken", 1.0)).await.unwrap();

        let batch = vec![
            Metric::counter("a", 1),
            Metric::counter("taken", 1),
            Metric::gauge("b", 2.0),
        ];
        let err = db.write_batch(&batch).await.unwrap_err();
        assert!(matches!(err, StorageError::WrongType { .. }), "{err:?}");
        assert!(db.list_counters().await.unwrap().is_empty());
        assert_eq!(db.list_gauges().await.unwrap().len(), 1);

        let mut malformed = Metric::counter("c", 1);
        malformed.delta = None;
        let err = db
            .write_batch(&[Metric::gauge("d", 1.0), malformed])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(matches!(
            db.read_gauge("d").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn batch_accumulates_repeated_counters() {
        let (_dir, db) = setup().await;
        db.write_batch(&[
            Metric::counter("PollCount", 2),
            Metric::counter("PollCount", 3),
            Metric::gauge("Alloc", 0.5),
        ])
        .await
        .unwrap();
        assert_eq!(db.read_counter("PollCount").await.unwrap().delta, Some(5));
        assert_eq!(db.read_gauge("Alloc").await.unwrap().value, Some(0.5));
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_schedule() {
        let (_dir, db) = setup().await;
        // Closing a second handle closes the shared pool underneath the
        // backend, so every attempt fails to acquire a connection.
        db.conn().unwrap().close().await.unwrap();

        tokio::time::pause();
        let start = tokio::time::Instant::now();
        let err = db.write_gauge(&Metric::gauge("Y", 1.0)).await.unwrap_err();
        let waited = start.elapsed();

        assert!(err.is_transient(), "{err:?}");
        assert!(waited >= Duration::from_secs(9) && waited < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_dir, db) = setup().await;
        db.ping().await.unwrap();
        db.close().await.unwrap();
        db.close().await.unwrap();
        assert!(matches!(
            db.read_gauge("Y").await,
            Err(StorageError::Closed)
        ));
    }
}
