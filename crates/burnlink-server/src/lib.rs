pub mod auth;
pub mod crypto;
pub mod dirs;
pub mod handlers;
pub mod issuance;
pub mod redemption;
pub mod server;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use store::{AuditEntry, Store, StoreError};

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Concrete store handle, used for the audit trail and admin pruning.
    pub store: Store,
    pub issuer: issuance::Issuer,
    pub redeemer: redemption::Redeemer,
    /// Bearer token for the admin endpoints. Admin endpoints are disabled when unset.
    pub admin_token: Option<String>,
    pub store_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: Store,
        policy: issuance::IssuePolicy,
        store_timeout: Duration,
        admin_token: Option<String>,
    ) -> Self {
        let shared: Arc<dyn store::SecretStore> = Arc::new(store.clone());
        Self {
            issuer: issuance::Issuer::new(Arc::clone(&shared), policy, store_timeout),
            redeemer: redemption::Redeemer::new(shared, store_timeout),
            store,
            admin_token,
            store_timeout,
        }
    }

    /// Run `op` against the store on the blocking pool, bounded by `store_timeout`.
    pub async fn with_store<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        store::run_blocking(self.store_timeout, move || Ok(op(&store)?)).await
    }

    /// Append to the audit trail. Failures are logged and otherwise ignored.
    pub async fn audit(&self, entry: AuditEntry) {
        let event = entry.event;
        if let Err(e) = self.with_store(move |s| s.record_audit(entry)).await {
            warn!(error = %e, ?event, "failed to record audit entry");
        }
    }
}

pub use server::{
    build_router, read_key_file, resolve_admin_token, resolve_data_dir, run, ServerConfig,
};
