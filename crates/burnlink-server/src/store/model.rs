use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Stored in redb as bincode-encoded bytes.
/// `encrypted_payload` is the packed `key || nonce || ciphertext+tag` blob; the
/// store never looks inside it. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// Store-assigned id (32 hex chars).
    pub id: String,
    pub access_token: String,
    pub encrypted_payload: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
    /// Set exactly once, by a successful claim.
    pub accessed: bool,
    pub accessed_at: Option<i64>,
}

impl SecretRecord {
    /// True once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn is_redeemable(&self, now: i64) -> bool {
        !self.accessed && !self.is_expired(now)
    }
}

/// Fields supplied by the issuer; the store fills in the rest.
#[derive(Debug)]
pub struct NewSecret {
    pub access_token: String,
    pub encrypted_payload: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_at: i64, accessed: bool) -> SecretRecord {
        SecretRecord {
            id: "id".into(),
            access_token: "token".into(),
            encrypted_payload: vec![],
            created_at: 0,
            expires_at,
            accessed,
            accessed_at: None,
        }
    }

    #[test]
    fn redeemable_only_before_expiry_and_unaccessed() {
        assert!(record(1_001, false).is_redeemable(1_000));
        assert!(!record(1_000, false).is_redeemable(1_000));
        assert!(!record(999, false).is_redeemable(1_000));
        assert!(!record(5_000, true).is_redeemable(1_000));
    }
}
