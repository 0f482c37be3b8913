// =============================================================================
// Credential store
// =============================================================================
//
// Passwords are stored as HMAC-SHA256(salt, password) with a random per-user
// salt. Plaintext never leaves `register`. Digests are compared in constant
// time.
// =============================================================================

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Verifies login credentials.
pub trait AuthStore: Send + Sync {
    fn verify(&self, email: &str, password: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("email must not be empty")]
    EmptyEmail,
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("an account for {0} already exists")]
    AlreadyRegistered(String),
}

struct StoredCredential {
    salt: String,
    digest: String,
}

#[derive(Default)]
pub struct InMemoryAuthStore {
    users: RwLock<HashMap<String, StoredCredential>>,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account. Emails are matched case-insensitively.
    pub fn register(&self, email: &str, password: &str) -> Result<(), CredentialError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(CredentialError::EmptyEmail);
        }
        if password.is_empty() {
            return Err(CredentialError::EmptyPassword);
        }

        let mut users = self.users.write();
        if users.contains_key(&email) {
            return Err(CredentialError::AlreadyRegistered(email));
        }
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let digest = digest(&salt, password);
        users.insert(email.clone(), StoredCredential { salt, digest });
        debug!(%email, "credential registered");
        Ok(())
    }

    pub fn remove(&self, email: &str) -> bool {
        self.users.write().remove(&normalize_email(email)).is_some()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuthStore for InMemoryAuthStore {
    fn verify(&self, email: &str, password: &str) -> bool {
        let email = normalize_email(email);
        let users = self.users.read();
        let Some(stored) = users.get(&email) else {
            warn!(%email, "login attempt for unknown account");
            return false;
        };
        let ok = constant_time_eq(digest(&stored.salt, password).as_bytes(), stored.digest.as_bytes());
        if !ok {
            warn!(%email, "invalid password presented");
        }
        ok
    }
}

impl std::fmt::Debug for InMemoryAuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAuthStore")
            .field("accounts", &self.len())
            .finish()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn digest(salt: &str, password: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(salt.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(password.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compare two byte slices in constant time. The loop always visits every
/// byte; only a length mismatch returns early.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_registered_credentials_case_insensitively() {
        let store = InMemoryAuthStore::new();
        store.register("Trader@Example.com", "hunter2").unwrap();

        assert!(store.verify("trader@example.com", "hunter2"));
        assert!(store.verify("  TRADER@EXAMPLE.COM ", "hunter2"));
        assert!(!store.verify("trader@example.com", "Hunter2"));
        assert!(!store.verify("other@example.com", "hunter2"));
    }

    #[test]
    fn never_stores_plaintext_and_salts_per_user() {
        let store = InMemoryAuthStore::new();
        store.register("a@x.io", "same-password").unwrap();
        store.register("b@x.io", "same-password").unwrap();

        let users = store.users.read();
        let a = &users["a@x.io"];
        let b = &users["b@x.io"];
        assert_ne!(a.digest, "same-password");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn rejects_duplicates_and_empty_fields() {
        let store = InMemoryAuthStore::new();
        store.register("a@x.io", "pw").unwrap();
        assert_eq!(
            store.register("A@X.IO", "pw2"),
            Err(CredentialError::AlreadyRegistered("a@x.io".into()))
        );
        assert_eq!(store.register(" ", "pw"), Err(CredentialError::EmptyEmail));
        assert_eq!(store.register("c@x.io", ""), Err(CredentialError::EmptyPassword));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn removed_accounts_stop_verifying() {
        let store = InMemoryAuthStore::new();
        store.register("a@x.io", "pw").unwrap();
        assert!(store.remove("A@x.io"));
        assert!(!store.verify("a@x.io", "pw"));
        assert!(!store.remove("a@x.io"));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
