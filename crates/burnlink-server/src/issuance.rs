//! Link issuance: validate, encrypt, store, hand back a bearer token.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::crypto::{self, CryptoError};
use crate::store::{self, NewSecret, SecretStore, StoreError};

/// Seven days.
pub const DEFAULT_MAX_TTL_MINUTES: i64 = 7 * 24 * 60;
pub const DEFAULT_MAX_CONTENT_BYTES: usize = 1_048_576;

/// Limits applied to every issuance request.
#[derive(Debug, Clone, Copy)]
pub struct IssuePolicy {
    pub max_ttl_minutes: i64,
    pub max_content_bytes: usize,
}

impl Default for IssuePolicy {
    fn default() -> Self {
        Self {
            max_ttl_minutes: DEFAULT_MAX_TTL_MINUTES,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("{0}")]
    Validation(String),
    #[error("encrypt content: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store link: {0}")]
    Store(#[from] StoreError),
}

/// A freshly issued link. `expires_at` is unix milliseconds.
#[derive(Debug, Clone)]
pub struct IssuedLink {
    pub record_id: String,
    pub access_token: String,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct Issuer {
    store: Arc<dyn SecretStore>,
    policy: IssuePolicy,
    store_timeout: Duration,
}

impl Issuer {
    pub fn new(store: Arc<dyn SecretStore>, policy: IssuePolicy, store_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            store_timeout,
        }
    }

    pub fn policy(&self) -> &IssuePolicy {
        &self.policy
    }

    /// Check `content` and `ttl_minutes` against the policy.
    pub fn validate(&self, content: &str, ttl_minutes: i64) -> Result<(), IssueError> {
        if content.trim().is_empty() {
            return Err(IssueError::Validation("content must not be empty".into()));
        }
        if content.len() > self.policy.max_content_bytes {
            return Err(IssueError::Validation(format!(
                "content exceeds {} byte limit",
                self.policy.max_content_bytes
            )));
        }
        if ttl_minutes <= 0 {
            return Err(IssueError::Validation(
                "expiresInMinutes must be a positive number of minutes".into(),
            ));
        }
        if ttl_minutes > self.policy.max_ttl_minutes {
            return Err(IssueError::Validation(format!(
                "expiresInMinutes must not exceed {}",
                self.policy.max_ttl_minutes
            )));
        }
        Ok(())
    }

    /// Encrypt `content` under a fresh key, store it, and return the token
    /// that redeems it. Nothing is written when validation fails.
    pub async fn issue(&self, content: &str, ttl_minutes: i64) -> Result<IssuedLink, IssueError> {
        self.validate(content, ttl_minutes)?;

        let created_at = store::now_millis();
        let expires_at = ttl_minutes
            .checked_mul(60_000)
            .and_then(|ttl_ms| created_at.checked_add(ttl_ms))
            .ok_or_else(|| IssueError::Validation("expiresInMinutes is too large".into()))?;

        let encrypted_payload = crypto::seal(content.as_bytes())?;
        let access_token = crypto::generate_access_token();

        let secret = NewSecret {
            access_token: access_token.clone(),
            encrypted_payload,
            created_at,
            expires_at,
        };
        let record_id =
            store::run_with_timeout(&self.store, self.store_timeout, move |s| s.insert(secret))
                .await?;

        debug!(id = %record_id, ttl_minutes, "issued link");
        Ok(IssuedLink {
            record_id,
            access_token,
            expires_at,
        })
    }
}
