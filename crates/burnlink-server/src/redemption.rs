//! Link redemption: claim the record atomically, then decrypt.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError};
use crate::store::{self, ClaimOutcome, SecretStore, StoreError};

#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("{0}")]
    Validation(String),
    #[error("link not found")]
    NotFound,
    #[error("link {record_id} was already accessed")]
    AlreadyAccessed { record_id: String },
    #[error("link {record_id} has expired")]
    Expired { record_id: String },
    #[error("decrypt link {record_id}: {source}")]
    Crypto {
        record_id: String,
        #[source]
        source: CryptoError,
    },
    #[error("claim link: {0}")]
    Store(#[from] StoreError),
}

/// Plaintext handed to the one caller that won the claim.
pub struct RedeemedSecret {
    pub record_id: String,
    pub content: Zeroizing<String>,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl std::fmt::Debug for RedeemedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeemedSecret")
            .field("record_id", &self.record_id)
            .field("content", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct Redeemer {
    store: Arc<dyn SecretStore>,
    store_timeout: Duration,
}

impl Redeemer {
    pub fn new(store: Arc<dyn SecretStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    pub async fn redeem(&self, token: &str) -> Result<RedeemedSecret, RedeemError> {
        self.redeem_at(token, store::now_millis()).await
    }

    /// Redeem `token` as of `now_ms` (unix milliseconds).
    ///
    /// The claim commits before decryption: a payload that fails to decrypt
    /// still spends the link.
    pub async fn redeem_at(&self, token: &str, now_ms: i64) -> Result<RedeemedSecret, RedeemError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(RedeemError::Validation("access token is required".into()));
        }

        let owned = token.to_owned();
        let outcome = store::run_with_timeout(&self.store, self.store_timeout, move |s| {
            s.claim_if_redeemable(&owned, now_ms)
        })
        .await?;

        let record = match outcome {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::NotFound => return Err(RedeemError::NotFound),
            ClaimOutcome::AlreadyAccessed { id } => {
                return Err(RedeemError::AlreadyAccessed { record_id: id })
            }
            ClaimOutcome::Expired { id } => {
                self.spawn_cleanup(id.clone());
                return Err(RedeemError::Expired { record_id: id });
            }
        };

        let content = crypto::open_text(&record.encrypted_payload).map_err(|source| {
            error!(id = %record.id, error = %source, "claimed link failed to decrypt");
            RedeemError::Crypto {
                record_id: record.id.clone(),
                source,
            }
        })?;

        debug!(id = %record.id, "redeemed link");
        Ok(RedeemedSecret {
            record_id: record.id.clone(),
            content,
            created_at: record.created_at,
        })
    }

    /// Best-effort removal of an expired record. The outcome of the
    /// redemption never depends on it.
    fn spawn_cleanup(&self, id: String) {
        let store = Arc::clone(&self.store);
        let timeout = self.store_timeout;
        tokio::spawn(async move {
            let target = id.clone();
            match store::run_with_timeout(&store, timeout, move |s| s.delete(&target)).await {
                Ok(()) => debug!(id = %id, "removed expired link"),
                Err(e) => warn!(id = %id, error = %e, "failed to remove expired link"),
            }
        });
    }
}
