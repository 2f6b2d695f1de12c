//! Identity resolution seam.
//!
//! The relay does not implement credential hashing or token issuance; it
//! consumes a resolved identity from whatever sits behind
//! [`IdentityResolver`]. The store-backed resolver here treats the
//! credential as the identity key itself, which is what development and
//! the test suite use.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use parley_shared::UserId;
use parley_store::{Database, User};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("empty credential")]
    InvalidCredential,

    #[error("unknown identity")]
    UnknownIdentity,

    #[error("auth backend error: {0}")]
    Backend(String),
}

/// Resolves a presented credential or token to an identity.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Dev/test resolver backed by the relay's own user table.
///
/// With `auto_register` (the config's `registration_open`), an unknown
/// identity is created on first login instead of rejected.
pub struct StoreResolver {
    store: Arc<Mutex<Database>>,
    auto_register: bool,
}

impl StoreResolver {
    pub fn new(store: Arc<Mutex<Database>>, auto_register: bool) -> Self {
        Self {
            store,
            auto_register,
        }
    }
}

impl IdentityResolver for StoreResolver {
    fn resolve(&self, credential: &str) -> Result<UserId, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        let user = UserId::new(credential);
        let store = self
            .store
            .lock()
            .map_err(|_| AuthError::Backend("store lock poisoned".into()))?;

        let known = store
            .user_exists(&user)
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        if known {
            return Ok(user);
        }

        if !self.auto_register {
            return Err(AuthError::UnknownIdentity);
        }

        tracing::info!(user = %user, "registering new identity");
        store
            .create_user(&User {
                id: user.clone(),
                display_name: user.to_string(),
                created_at: Utc::now(),
            })
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Arc<Mutex<Database>>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_relay_at(&dir.path().join("relay.db")).unwrap();
        (dir, Arc::new(Mutex::new(db)))
    }

    #[test]
    fn empty_credential_is_rejected() {
        let (_dir, store) = store();
        let resolver = StoreResolver::new(store, true);
        assert!(matches!(
            resolver.resolve("  "),
            Err(AuthError::InvalidCredential)
        ));
    }

    #[test]
    fn unknown_identity_rejected_when_registration_closed() {
        let (_dir, store) = store();
        let resolver = StoreResolver::new(store, false);
        assert!(matches!(
            resolver.resolve("newcomer"),
            Err(AuthError::UnknownIdentity)
        ));
    }

    #[test]
    fn auto_register_creates_the_user_once() {
        let (_dir, store) = store();
        let resolver = StoreResolver::new(store.clone(), true);

        assert_eq!(resolver.resolve("fresh").unwrap(), UserId::new("fresh"));
        assert_eq!(resolver.resolve("fresh").unwrap(), UserId::new("fresh"));
        assert!(store.lock().unwrap().user_exists(&UserId::new("fresh")).unwrap());
    }
}
