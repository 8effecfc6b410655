//! Secret record persistence.
//!
//! [`SecretStore`] is the narrow contract the services depend on; [`Store`]
//! implements it on top of an embedded redb database.

pub mod audit;
pub mod db;
pub mod model;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub use audit::{AuditEntry, AuditFilter, LinkEvent, Outcome};
pub use db::{Store, SweepReport};
pub use model::{NewSecret, SecretRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("access token already exists")]
    DuplicateToken,
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Outcome of [`SecretStore::claim_if_redeemable`].
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The record was unclaimed and live; it is now marked accessed.
    Claimed(SecretRecord),
    AlreadyAccessed { id: String },
    Expired { id: String },
    NotFound,
}

/// Storage operations required by the issuance and redemption services.
pub trait SecretStore: Send + Sync + 'static {
    /// Insert a new record and return its store-assigned id.
    fn insert(&self, secret: NewSecret) -> Result<String, StoreError>;

    fn find_by_token(&self, token: &str) -> Result<Option<SecretRecord>, StoreError>;

    /// Atomically mark the record for `token` accessed if it is unclaimed and
    /// `expires_at > now_ms`. Never mutates on any other outcome.
    fn claim_if_redeemable(&self, token: &str, now_ms: i64) -> Result<ClaimOutcome, StoreError>;

    /// Remove a record by id. Missing ids are not an error.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Remove every record with `expires_at <= now_ms`, returning their ids.
    fn prune_expired(&self, now_ms: i64) -> Result<Vec<String>, StoreError>;
}

/// Run a blocking store call off the async runtime, giving up after `timeout`.
///
/// A call abandoned on timeout keeps running on the blocking pool and may
/// still commit.
pub async fn run_blocking<T, F>(timeout: Duration, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(op);
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(StoreError::Backend(anyhow::anyhow!(
            "store task failed: {join_err}"
        ))),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// [`run_blocking`] against a shared [`SecretStore`].
pub async fn run_with_timeout<T, F>(
    store: &Arc<dyn SecretStore>,
    timeout: Duration,
    op: F,
) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn SecretStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    run_blocking(timeout, move || op(store.as_ref())).await
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
