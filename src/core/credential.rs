//! Agent credential lifecycle: issuance, resolution and rotation.
//!
//! Plaintext keys exist only in the value returned by [`CredentialManager::issue`]
//! (and `register`/`rotate`, which call it). Storage holds the hex digest plus
//! a 12 character display prefix. A rotation keeps exactly one previous
//! generation alive until `previous_key_expires_at`.

use crate::core::digest::{KeyDigest, Sha256Digest, hash_key, to_hex};
use crate::core::error::AgentFeedError;
use crate::core::time::Clock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Literal tag every issued key starts with.
pub const API_KEY_PREFIX: &str = "af_live_";
/// Random bytes per key; rendered as twice as many hex characters.
pub const API_KEY_RANDOM_BYTES: usize = 32;
pub const API_KEY_LENGTH: usize = API_KEY_PREFIX.len() + API_KEY_RANDOM_BYTES * 2;
/// Characters of plaintext kept for display.
pub const DISPLAY_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub identity_id: String,
    pub current_key_hash: String,
    pub current_key_prefix: String,
    pub previous_key_hash: Option<String>,
    /// Epoch milliseconds; `None` means no grace window.
    pub previous_key_expires_at: Option<u64>,
}

impl Credential {
    pub fn new(identity_id: &str, key: &IssuedKey) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            current_key_hash: key.hash.clone(),
            current_key_prefix: key.prefix.clone(),
            previous_key_hash: None,
            previous_key_expires_at: None,
        }
    }

    /// Whether the previous key is still honored at `now_ms`.
    pub fn grace_active(&self, now_ms: u64) -> bool {
        self.previous_key_hash.is_some()
            && self
                .previous_key_expires_at
                .is_some_and(|expires| expires > now_ms)
    }
}

/// Partial update applied by [`CredentialStore::update`]. `None` leaves a
/// field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPatch {
    pub current_key_hash: Option<String>,
    pub current_key_prefix: Option<String>,
    pub previous_key_hash: Option<String>,
    pub previous_key_expires_at: Option<u64>,
}

impl CredentialPatch {
    pub fn apply(&self, credential: &mut Credential) {
        if let Some(hash) = &self.current_key_hash {
            credential.current_key_hash = hash.clone();
        }
        if let Some(prefix) = &self.current_key_prefix {
            credential.current_key_prefix = prefix.clone();
        }
        if let Some(hash) = &self.previous_key_hash {
            credential.previous_key_hash = Some(hash.clone());
        }
        if let Some(expires) = self.previous_key_expires_at {
            credential.previous_key_expires_at = Some(expires);
        }
    }
}

/// Keyed record store holding credentials. Implementations provide their own
/// concurrency control.
pub trait CredentialStore {
    fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, AgentFeedError>;
    /// Only returns a credential whose grace window is still open at `now_ms`.
    fn find_by_old_hash(&self, hash: &str, now_ms: u64)
    -> Result<Option<Credential>, AgentFeedError>;
    fn find_by_identity(&self, identity_id: &str) -> Result<Option<Credential>, AgentFeedError>;
    fn insert(&self, credential: &Credential) -> Result<(), AgentFeedError>;
    fn update(&self, identity_id: &str, patch: &CredentialPatch) -> Result<(), AgentFeedError>;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, AgentFeedError> {
        (**self).find_by_hash(hash)
    }
    fn find_by_old_hash(
        &self,
        hash: &str,
        now_ms: u64,
    ) -> Result<Option<Credential>, AgentFeedError> {
        (**self).find_by_old_hash(hash, now_ms)
    }
    fn find_by_identity(&self, identity_id: &str) -> Result<Option<Credential>, AgentFeedError> {
        (**self).find_by_identity(identity_id)
    }
    fn insert(&self, credential: &Credential) -> Result<(), AgentFeedError> {
        (**self).insert(credential)
    }
    fn update(&self, identity_id: &str, patch: &CredentialPatch) -> Result<(), AgentFeedError> {
        (**self).update(identity_id, patch)
    }
}

/// Process-local store used by tests and batch replays.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: Mutex<HashMap<String, Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Credential>>, AgentFeedError> {
        self.records
            .lock()
            .map_err(|_| AgentFeedError::LockPoisoned("credential store".to_string()))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, AgentFeedError> {
        Ok(self
            .lock()?
            .values()
            .find(|c| c.current_key_hash == hash)
            .cloned())
    }

    fn find_by_old_hash(
        &self,
        hash: &str,
        now_ms: u64,
    ) -> Result<Option<Credential>, AgentFeedError> {
        Ok(self
            .lock()?
            .values()
            .find(|c| c.previous_key_hash.as_deref() == Some(hash) && c.grace_active(now_ms))
            .cloned())
    }

    fn find_by_identity(&self, identity_id: &str) -> Result<Option<Credential>, AgentFeedError> {
        Ok(self.lock()?.get(identity_id).cloned())
    }

    fn insert(&self, credential: &Credential) -> Result<(), AgentFeedError> {
        let mut records = self.lock()?;
        if records.contains_key(&credential.identity_id) {
            return Err(AgentFeedError::ValidationError(format!(
                "identity '{}' already has a credential",
                credential.identity_id
            )));
        }
        records.insert(credential.identity_id.clone(), credential.clone());
        Ok(())
    }

    fn update(&self, identity_id: &str, patch: &CredentialPatch) -> Result<(), AgentFeedError> {
        let mut records = self.lock()?;
        let credential = records
            .get_mut(identity_id)
            .ok_or_else(|| AgentFeedError::NotFound(format!("identity '{}'", identity_id)))?;
        patch.apply(credential);
        Ok(())
    }
}

/// A freshly generated key. The plaintext is shown to the caller once and
/// is redacted from `Debug` output.
#[derive(Clone)]
pub struct IssuedKey {
    pub plaintext: String,
    pub hash: String,
    pub prefix: String,
}

impl fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedKey")
            .field("plaintext", &"[REDACTED]")
            .field("hash", &self.hash)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RotatedKey {
    pub key: IssuedKey,
    /// When the replaced key stops working (epoch milliseconds).
    pub previous_key_expires_at: u64,
}

/// Cheap structural check run before any hashing or store access.
pub fn is_valid_key_format(token: &str) -> bool {
    token.len() == API_KEY_LENGTH
        && token
            .strip_prefix(API_KEY_PREFIX)
            .is_some_and(|suffix| suffix.bytes().all(|b| b.is_ascii_hexdigit()))
}

pub fn display_prefix(plaintext: &str) -> String {
    plaintext.chars().take(DISPLAY_PREFIX_LEN).collect()
}

pub struct CredentialManager<S: CredentialStore> {
    store: S,
    digest: Box<dyn KeyDigest>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
}

impl<S: CredentialStore> CredentialManager<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, grace_period: Duration) -> Self {
        Self {
            store,
            digest: Box::new(Sha256Digest),
            clock,
            grace_period,
        }
    }

    pub fn with_digest(mut self, digest: impl KeyDigest + 'static) -> Self {
        self.digest = Box::new(digest);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn hash(&self, plaintext: &str) -> String {
        hash_key(self.digest.as_ref(), plaintext)
    }

    /// Generate a new key. Nothing is persisted.
    pub fn issue(&self) -> IssuedKey {
        let mut bytes = [0u8; API_KEY_RANDOM_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let plaintext = format!("{}{}", API_KEY_PREFIX, to_hex(&bytes));
        IssuedKey {
            hash: self.hash(&plaintext),
            prefix: display_prefix(&plaintext),
            plaintext,
        }
    }

    /// Issue and persist the first credential of a new identity.
    pub fn register(&self, identity_id: &str) -> Result<IssuedKey, AgentFeedError> {
        let key = self.issue();
        self.store.insert(&Credential::new(identity_id, &key))?;
        Ok(key)
    }

    /// Map a presented token to its credential. Malformed, unknown and
    /// expired tokens all return `Ok(None)`.
    pub fn resolve(&self, token: &str) -> Result<Option<Credential>, AgentFeedError> {
        if !is_valid_key_format(token) {
            return Ok(None);
        }
        let hash = self.hash(token);
        if let Some(credential) = self.store.find_by_hash(&hash)? {
            return Ok(Some(credential));
        }
        self.store.find_by_old_hash(&hash, self.clock.now_ms())
    }

    /// Replace the current key. The old key keeps working for the grace
    /// period; any key older than that is dropped immediately.
    pub fn rotate(&self, identity_id: &str) -> Result<RotatedKey, AgentFeedError> {
        let existing = self
            .store
            .find_by_identity(identity_id)?
            .ok_or_else(|| AgentFeedError::NotFound(format!("identity '{}'", identity_id)))?;

        let key = self.issue();
        let grace_ms = u64::try_from(self.grace_period.as_millis()).unwrap_or(u64::MAX);
        let expires_at = self.clock.now_ms().saturating_add(grace_ms);
        let patch = CredentialPatch {
            current_key_hash: Some(key.hash.clone()),
            current_key_prefix: Some(key.prefix.clone()),
            previous_key_hash: Some(existing.current_key_hash),
            previous_key_expires_at: Some(expires_at),
        };
        self.store.update(identity_id, &patch)?;

        Ok(RotatedKey {
            key,
            previous_key_expires_at: expires_at,
        })
    }
}
