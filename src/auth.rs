//! API-key issuance and verification (§4.9).
//!
//! Keys are `sk-` followed by 32 random bytes, hex-encoded. `verify`
//! accepts either the configured master key or a DB-backed lookup, and
//! always walks every byte of the comparison so timing does not leak an
//! early mismatch (§8 property 8).

use rand::RngCore;
use serde::Serialize;
use tracing::warn;

use crate::store::db::{ApiKeyRow, Db};

/// A newly issued API key.
#[derive(Clone, Serialize)]
pub struct IssuedKey {
    /// The key value, `sk-<64 hex chars>`.
    pub key: String,
    /// Human label.
    pub name: String,
    /// Assigned role.
    pub role: String,
}

impl std::fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedKey")
            .field("key", &"[REDACTED]")
            .field("name", &self.name)
            .field("role", &self.role)
            .finish()
    }
}

/// Number of random bytes hex-encoded into a new key (64 hex chars, §3
/// "prefix `sk-` followed by ≥32 hex chars").
const KEY_RANDOM_BYTES: usize = 32;

/// Register a new API key with role `frontend` (§4.9).
///
/// # Errors
///
/// Returns an error if the key cannot be persisted.
pub async fn register(db: &Db, name: &str) -> anyhow::Result<IssuedKey> {
    let mut bytes = [0u8; KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let key = format!("sk-{}", hex_encode(&bytes));

    let row = ApiKeyRow {
        key: key.clone(),
        name: name.to_owned(),
        role: "frontend".to_owned(),
        is_active: true,
        created_at: chrono::Utc::now(),
        last_used_at: None,
    };
    db.insert_api_key(&row).await?;

    Ok(IssuedKey { key, name: name.to_owned(), role: "frontend".to_owned() })
}

/// Outcome of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Token matches the configured master key or an active DB-backed key.
    Valid,
    /// Token is well-formed but not recognized, or belongs to a revoked key.
    Invalid,
}

/// Verify a bearer token against the configured master key or the database.
///
/// On a DB-backed match, `last_used_at` is updated best-effort; a failure
/// to update it does not affect the verification result.
///
/// # Errors
///
/// Returns an error only if the database read itself fails (not on a
/// simple mismatch, which yields `Ok(VerifyOutcome::Invalid)`).
pub async fn verify(db: &Db, master_key: Option<&str>, token: &str) -> anyhow::Result<VerifyOutcome> {
    if let Some(master) = master_key {
        if constant_time_eq(master.as_bytes(), token.as_bytes()) {
            return Ok(VerifyOutcome::Valid);
        }
    }

    match db.find_api_key(token).await? {
        Some(row) if row.is_active => {
            if let Err(e) = db.touch_last_used(token).await {
                warn!(error = %e, "failed to update last_used_at");
            }
            Ok(VerifyOutcome::Valid)
        }
        _ => Ok(VerifyOutcome::Invalid),
    }
}

/// Compare two byte slices without early-exit on the first mismatch.
///
/// Length differences still short-circuit; for API keys of a fixed prefix
/// and length this is acceptable (§8 property 8 only requires no early-out
/// *within* a comparison of matching length).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::Db;

    #[tokio::test]
    async fn register_issues_prefixed_key_and_persists_it() {
        let db = Db::open_in_memory().await.expect("open db");
        let issued = register(&db, "test client").await.expect("register");
        assert!(issued.key.starts_with("sk-"));
        assert_eq!(issued.key.len(), 3 + KEY_RANDOM_BYTES * 2);

        let outcome = verify(&db, None, &issued.key).await.expect("verify");
        assert_eq!(outcome, VerifyOutcome::Valid);
    }

    #[tokio::test]
    async fn master_key_is_accepted_without_db_entry() {
        let db = Db::open_in_memory().await.expect("open db");
        let outcome = verify(&db, Some("sk-master"), "sk-master").await.expect("verify");
        assert_eq!(outcome, VerifyOutcome::Valid);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let db = Db::open_in_memory().await.expect("open db");
        let outcome = verify(&db, None, "sk-doesnotexist").await.expect("verify");
        assert_eq!(outcome, VerifyOutcome::Invalid);
    }

    #[tokio::test]
    async fn revoked_key_is_invalid() {
        let db = Db::open_in_memory().await.expect("open db");
        let issued = register(&db, "test client").await.expect("register");
        db.deactivate_api_key(&issued.key).await.expect("deactivate");

        let outcome = verify(&db, None, &issued.key).await.expect("verify");
        assert_eq!(outcome, VerifyOutcome::Invalid);
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq(b"short", b"longer string"));
    }
}
