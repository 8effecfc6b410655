use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::audit::{AuditEntry, AuditFilter, LinkEvent, Outcome};
use super::model::{NewSecret, SecretRecord};
use super::{now_millis, ClaimOutcome, SecretStore, StoreError};

/// Record id → encoded [`SecretRecord`].
const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
/// Access token → record id.
const TOKENS: TableDefinition<&str, &str> = TableDefinition::new("secret_tokens");
/// (unix ms, seq) → bincode [`AuditEntry`]. Keys sort by time, so time
/// windows are range scans.
const LINK_AUDIT: TableDefinition<(i64, u64), &[u8]> = TableDefinition::new("link_audit");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const AUDIT_SEQ_KEY: &str = "audit_seq";

/// Source recorded for entries written by the sweeper.
const SWEEP_SOURCE: &str = "internal";

/// Leading byte of every encoded record.
const RECORD_V1_MARKER: u8 = 0x01;

/// Thread-safe handle to the redb store.
///
/// redb serializes write transactions, so every read-check-write sequence
/// performed inside one write transaction is atomic with respect to all
/// other writers, in this process or any other holding the file.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(TOKENS)?;
        write_txn.open_table(LINK_AUDIT)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Returns `None` when the token is already taken; nothing is written then.
    fn insert_record(&self, secret: NewSecret) -> Result<Option<String>> {
        let id = generate_record_id();
        let record = SecretRecord {
            id: id.clone(),
            access_token: secret.access_token,
            encrypted_payload: secret.encrypted_payload,
            created_at: secret.created_at,
            expires_at: secret.expires_at,
            accessed: false,
            accessed_at: None,
        };
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut tokens = write_txn.open_table(TOKENS)?;
            if tokens.get(record.access_token.as_str())?.is_some() {
                false
            } else {
                tokens.insert(record.access_token.as_str(), id.as_str())?;
                let mut secrets = write_txn.open_table(SECRETS)?;
                secrets.insert(id.as_str(), bytes.as_slice())?;
                true
            }
        };
        if !inserted {
            write_txn.abort()?;
            return Ok(None);
        }
        write_txn.commit()?;

        debug!(id = %id, expires_at = record.expires_at, "stored secret");
        Ok(Some(id))
    }

    fn lookup(&self, token: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let tokens = read_txn.open_table(TOKENS)?;
        let id: Option<String> = tokens.get(token)?.map(|guard| guard.value().to_owned());
        let Some(id) = id else {
            return Ok(None);
        };

        let secrets = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> =
            secrets.get(id.as_str())?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|bytes| decode(&bytes)).transpose()
    }

    fn claim(&self, token: &str, now: i64) -> Result<ClaimOutcome> {
        // The lookup, the predicate and the update share one write
        // transaction; a concurrent claim blocks in `begin_write` until this
        // one commits and then sees `accessed == true`.
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let tokens = write_txn.open_table(TOKENS)?;
            let mut secrets = write_txn.open_table(SECRETS)?;

            let id: Option<String> = tokens.get(token)?.map(|guard| guard.value().to_owned());
            // Clone the bytes so the AccessGuard (which borrows `secrets`) is
            // dropped before any mutation.
            let raw_bytes: Option<Vec<u8>> = match &id {
                Some(id) => secrets.get(id.as_str())?.map(|guard| guard.value().to_vec()),
                None => None,
            };

            match (id, raw_bytes) {
                (Some(id), Some(bytes)) => {
                    let mut record = decode(&bytes)?;
                    if record.is_redeemable(now) {
                        record.accessed = true;
                        record.accessed_at = Some(now);
                        let updated = encode(&record)?;
                        secrets.insert(id.as_str(), updated.as_slice())?;
                        debug!(id = %id, "claimed secret");
                        ClaimOutcome::Claimed(record)
                    } else if record.accessed {
                        ClaimOutcome::AlreadyAccessed { id }
                    } else {
                        ClaimOutcome::Expired { id }
                    }
                }
                _ => ClaimOutcome::NotFound,
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Delete a record and its token index entry. Returns true if it existed.
    fn remove(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut secrets = write_txn.open_table(SECRETS)?;
            let removed: Option<Vec<u8>> = secrets.remove(id)?.map(|guard| guard.value().to_vec());
            match removed {
                Some(bytes) => {
                    let record = decode(&bytes)?;
                    let mut tokens = write_txn.open_table(TOKENS)?;
                    tokens.remove(record.access_token.as_str())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Remove all expired records. Returns the ids of removed records.
    pub fn prune(&self, now: i64) -> Result<Vec<String>> {
        // Collect expired ids in a read pass first. Expiry is monotonic, so a
        // record seen expired here is still expired in the write pass.
        let expired: Vec<(String, String)> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let mut out = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record = decode(v.value())?;
                if record.is_expired(now) {
                    out.push((k.value().to_owned(), record.access_token.clone()));
                }
            }
            out
        };

        if expired.is_empty() {
            return Ok(vec![]);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut secrets = write_txn.open_table(SECRETS)?;
            let mut tokens = write_txn.open_table(TOKENS)?;
            for (id, token) in &expired {
                if secrets.remove(id.as_str())?.is_some() {
                    tokens.remove(token.as_str())?;
                }
            }
        }
        write_txn.commit()?;

        info!(removed = expired.len(), "pruned expired secrets");
        Ok(expired.into_iter().map(|(id, _)| id).collect())
    }

    /// Number of stored records, expired or not.
    pub fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        Ok(table.len()? as usize)
    }

    // ── Audit trail ───────────────────────────────────────────────────────

    /// Append `entry` and return the sequence number assigned to it.
    pub fn record_audit(&self, mut entry: AuditEntry) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters.get(AUDIT_SEQ_KEY)?.map_or(0, |g| g.value()) + 1;
            counters.insert(AUDIT_SEQ_KEY, seq)?;
            entry.seq = seq;

            let bytes = encode_entry(&entry)?;
            let mut audit = write_txn.open_table(LINK_AUDIT)?;
            audit.insert((entry.at, seq), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(entry.seq)
    }

    /// Entries matching `filter`, newest first.
    pub fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let since = filter.since.unwrap_or(i64::MIN);
        let until = filter.until.unwrap_or(i64::MAX);
        if since > until || filter.limit == 0 {
            return Ok(Vec::new());
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LINK_AUDIT)?;
        let mut out = Vec::new();
        for item in table.range((since, 0u64)..=(until, u64::MAX))?.rev() {
            let (_, v) = item?;
            let entry = decode_entry(v.value())?;
            if filter.matches(&entry) {
                out.push(entry);
                if out.len() == filter.limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Drop audit entries recorded before `cutoff` (unix ms).
    pub fn prune_audit(&self, cutoff: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(LINK_AUDIT)?;
            let stale = table
                .range(..(cutoff, 0u64))?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<Vec<_>, _>>()?;
            for key in &stale {
                table.remove(key)?;
            }
            stale.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            debug!(removed, "dropped old audit entries");
        }
        Ok(removed)
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// One maintenance pass at `now`: remove expired links, note each removal
    /// in the audit trail, then drop audit entries older than `audit_retention`.
    pub fn sweep(&self, now: i64, audit_retention: Duration) -> Result<SweepReport> {
        let expired = self.prune(now)?;
        for id in &expired {
            let mut entry = AuditEntry::new(LinkEvent::Expired, Outcome::Expired, SWEEP_SOURCE)
                .record(id.as_str());
            entry.at = now;
            if let Err(e) = self.record_audit(entry) {
                warn!(id = %id, error = %e, "failed to record audit entry");
            }
        }

        let retention_ms = i64::try_from(audit_retention.as_millis()).unwrap_or(i64::MAX);
        let audit_entries = self.prune_audit(now.saturating_sub(retention_ms))?;

        Ok(SweepReport {
            expired_links: expired.len(),
            audit_entries,
        })
    }

    /// Run [`Store::sweep`] on the blocking pool every `interval`.
    pub fn spawn_sweeper(self, interval: Duration, audit_retention: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let store = self.clone();
                let result =
                    tokio::task::spawn_blocking(move || store.sweep(now_millis(), audit_retention))
                        .await;
                match result {
                    Ok(Ok(report)) => {
                        if report != SweepReport::default() {
                            debug!(
                                expired = report.expired_links,
                                audit = report.audit_entries,
                                "sweep finished"
                            );
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e, "sweep failed"),
                    Err(e) => warn!(error = %e, "sweep task failed"),
                }
            }
        })
    }
}

/// What one [`Store::sweep`] removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_links: usize,
    pub audit_entries: usize,
}

impl SecretStore for Store {
    fn insert(&self, secret: NewSecret) -> Result<String, StoreError> {
        self.insert_record(secret)?.ok_or(StoreError::DuplicateToken)
    }

    fn find_by_token(&self, token: &str) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.lookup(token)?)
    }

    fn claim_if_redeemable(&self, token: &str, now_ms: i64) -> Result<ClaimOutcome, StoreError> {
        Ok(self.claim(token, now_ms)?)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        if self.remove(id)? {
            debug!(id = %id, "deleted secret");
        }
        Ok(())
    }

    fn prune_expired(&self, now_ms: i64) -> Result<Vec<String>, StoreError> {
        Ok(self.prune(now_ms)?)
    }
}

/// Generate a random 128-bit record id, hex encoded.
fn generate_record_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Encode a SecretRecord as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn encode_entry(entry: &AuditEntry) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(entry, bincode::config::standard())
        .context("encode audit entry")
}

fn decode_entry(bytes: &[u8]) -> Result<AuditEntry> {
    let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("decode audit entry")?;
    Ok(entry)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, rest)) => {
            let (record, _) = bincode::serde::decode_from_slice(rest, bincode::config::standard())
                .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format marker {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}
