//! Credential Store: the single bearer credential issued at login.
//!
//! At most one credential is active at a time and its presence means
//! "authenticated". The expiration time reported by the auth API is kept
//! next to it but never enforced here; a stale credential stays valid until
//! a downstream call rejects it.

mod store;

pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoreError};

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Storage key holding the bearer string.
pub const TOKEN_KEY: &str = "auth_token";

/// Storage key holding the raw expiration time, when the auth API supplied one.
pub const EXPIRY_KEY: &str = "auth_token_expires_at";

/// An opaque bearer string plus the expiration time reported with it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    expires_at: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_at: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// The expiration time exactly as the auth API returned it.
    pub fn expires_at(&self) -> Option<&str> {
        self.expires_at.as_deref()
    }

    /// True when the expiration time parses as RFC 3339 and lies before `now`.
    ///
    /// Unparseable or missing expiry never counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|expiry| expiry.with_timezone(&Utc) <= now)
            .unwrap_or(false)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Reads and writes the credential under fixed keys of a [`KeyValueStore`].
#[derive(Clone)]
pub struct CredentialStore {
    slot: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(slot: Arc<dyn KeyValueStore>) -> Self {
        Self { slot }
    }

    /// Store backed by `{dir}/storage.json`.
    pub fn file_backed(dir: &Path) -> Self {
        Self::new(Arc::new(JsonFileStore::in_dir(dir)))
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Replace the active credential.
    ///
    /// The expiry is written before the token. If the token write then
    /// fails, both keys are cleared so no token is left paired with an
    /// expiry that was not issued for it.
    pub fn store(&self, credential: &Credential) -> Result<(), StoreError> {
        match credential.expires_at() {
            Some(expiry) => self.slot.set(EXPIRY_KEY, expiry)?,
            None => self.slot.remove(EXPIRY_KEY)?,
        }
        if let Err(e) = self.slot.set(TOKEN_KEY, credential.access_token()) {
            if let Err(clear_err) = self.clear() {
                log::warn!("[Auth] Failed to clear credential after failed write: {}", clear_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// The active credential, if any. An empty stored token counts as absent.
    pub fn read(&self) -> Result<Option<Credential>, StoreError> {
        let token = match self.slot.get(TOKEN_KEY)? {
            Some(token) if !token.trim().is_empty() => token,
            _ => return Ok(None),
        };
        let credential = Credential::new(token, self.slot.get(EXPIRY_KEY)?);

        if credential.is_expired_at(Utc::now()) {
            log::warn!(
                "[Auth] Stored credential expired at {}; using it until the backend rejects it",
                credential.expires_at().unwrap_or("?")
            );
        }
        Ok(Some(credential))
    }

    /// Forget the active credential. Idempotent.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.slot.remove(TOKEN_KEY)?;
        self.slot.remove(EXPIRY_KEY)
    }

    /// Whether a credential is present. Read failures count as unauthenticated.
    pub fn is_authenticated(&self) -> bool {
        match self.read() {
            Ok(credential) => credential.is_some(),
            Err(e) => {
                log::warn!("[Auth] Failed to read credential store: {}", e);
                false
            }
        }
    }
}
