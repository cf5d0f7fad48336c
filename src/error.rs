//! Error taxonomy shared by the stores, the IGDB client and the sync engine.

use crate::database_ops::igdb::kinds::EntityKind;

/// Errors raised by a single unit of mirror/aggregate work.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Collection or document missing; callers usually branch on this.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: u64 },

    /// The remote catalog failed or returned something unusable.
    #[error("upstream failure: {0:#}")]
    Upstream(anyhow::Error),

    /// Persistence failed.
    #[error("store failure: {0}")]
    Store(String),

    /// Bad notification payload, credential or record shape.
    #[error("validation failure: {0}")]
    Validation(String),

    /// A store or remote call exceeded its deadline.
    #[error("{op} timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u128 },

    /// A pooled worker task panicked or was aborted.
    #[error("worker task aborted: {0}")]
    Worker(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Store(format!("document encoding: {err}"))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Upstream(err.into())
    }
}

/// Bound a store or remote future by `limit`, mapping expiry to [`SyncError::Timeout`].
pub async fn with_timeout<T, F>(op: &'static str, limit: std::time::Duration, fut: F) -> SyncResult<T>
where
    F: std::future::Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(SyncError::Timeout {
            op,
            millis: limit.as_millis(),
        }),
    }
}

/// Deadline for a batch of `items`: 5s base plus 200ms per item.
pub fn batch_timeout(items: usize) -> std::time::Duration {
    std::time::Duration::from_secs(5) + std::time::Duration::from_millis(200 * items as u64)
}
