use sea_orm::{sqlx, DbErr, RuntimeErr};
use telemon_common::error::MetricError;
use telemon_common::types::MetricKind;

/// Errors surfaced by every [`Storage`](crate::Storage) backend.
///
/// # Examples
///
/// ```rust
/// use telemon_common::types::MetricKind;
/// use telemon_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     kind: MetricKind::Gauge,
///     id: "Alloc".to_string(),
/// };
/// assert!(err.to_string().contains("Alloc"));
/// assert!(!err.is_transient());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No metric of this kind is stored under the id.
    #[error("Storage: {kind} '{id}' not found")]
    NotFound { kind: MetricKind, id: String },

    /// The id is already bound to the other kind, or the metric was handed to
    /// the writer of the other kind.
    #[error("Storage: metric '{id}' cannot be written as a {kind}")]
    WrongType { id: String, kind: MetricKind },

    #[error("Storage: {0}")]
    Validation(#[from] MetricError),

    /// A connection-level fault that may clear up on its own. Only returned
    /// once the retry schedule is exhausted.
    #[error("Storage: transient database failure: {0}")]
    Transient(#[source] DbErr),

    #[error("Storage: database error: {0}")]
    Database(#[source] DbErr),

    #[error("Storage: snapshot I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage: snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage: backend is closed")]
    Closed,
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<DbErr> for StorageError {
    fn from(err: DbErr) -> Self {
        if is_transient(&err) {
            StorageError::Transient(err)
        } else {
            StorageError::Database(err)
        }
    }
}

/// SQLSTATE class 08 codes treated as retryable: connection exception,
/// connection does not exist, connection failure.
const TRANSIENT_SQLSTATES: [&str; 3] = ["08000", "08003", "08006"];

fn is_transient(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => {
            is_transient_sqlx(e)
        }
        _ => false,
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code)),
        _ => false,
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::error::ConnAcquireErr;

    #[test]
    fn connection_faults_are_transient() {
        let err: StorageError = DbErr::ConnectionAcquire(ConnAcquireErr::ConnectionClosed).into();
        assert!(err.is_transient());

        let err: StorageError =
            DbErr::Exec(RuntimeErr::SqlxError(sqlx::Error::PoolTimedOut)).into();
        assert!(err.is_transient());
    }

    #[test]
    fn other_faults_are_permanent() {
        let err: StorageError = DbErr::RecordNotFound("metrics".into()).into();
        assert!(matches!(err, StorageError::Database(_)));

        let err: StorageError =
            DbErr::Query(RuntimeErr::SqlxError(sqlx::Error::RowNotFound)).into();
        assert!(!err.is_transient());
    }
}
