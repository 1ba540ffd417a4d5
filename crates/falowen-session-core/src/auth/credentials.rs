use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Access token, refresh token and expiry, stored and replaced as one unit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
}

impl CredentialPair {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// True when the access token expires within `window` of `now` (or already has).
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.expiry <= now + window
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expiry - now
    }
}

// Tokens never show up in logs or panic messages.
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Credential storage is unavailable: {0}")]
    Unavailable(String),

    #[error("Credential storage failure: {0}")]
    Backend(String),

    #[error("Stored credentials are corrupt: {0}")]
    Corrupt(String),

    #[error("Credential file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable storage for a single account's credential pair.
///
/// `read` returns `Ok(None)` when nothing is stored; errors are reserved for
/// genuine storage faults. `save` replaces the whole pair. `clear` succeeds
/// when nothing is stored.
pub trait CredentialStore: Send + Sync {
    fn read(&self) -> Result<Option<CredentialPair>, StoreError>;
    fn save(&self, pair: &CredentialPair) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// In-process store, used for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn read(&self) -> Result<Option<CredentialPair>, StoreError> {
        Ok(self.pair.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        *self.pair.lock().unwrap_or_else(|e| e.into_inner()) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.pair.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

/// OS keychain store. The pair is one JSON secret under `(service, account)`,
/// so a save is a single atomic replace.
pub struct KeyringCredentialStore {
    entry: Entry,
    account: String,
}

impl KeyringCredentialStore {
    pub fn new(service: &str, account: &str) -> Result<Self, StoreError> {
        let entry = Entry::new(service, account).map_err(map_keyring_error)?;
        Ok(Self {
            entry,
            account: account.to_string(),
        })
    }
}

fn map_keyring_error(err: keyring::Error) -> StoreError {
    match err {
        keyring::Error::NoStorageAccess(e) => StoreError::Unavailable(e.to_string()),
        keyring::Error::BadEncoding(_) => {
            StoreError::Corrupt("keychain entry is not valid UTF-8".to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn read(&self) -> Result<Option<CredentialPair>, StoreError> {
        match self.entry.get_password() {
            Ok(secret) => serde_json::from_str(&secret)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        let secret =
            serde_json::to_string(pair).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.entry.set_password(&secret).map_err(map_keyring_error)?;
        debug!(account = %self.account, "Credential pair written to keychain");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_pair() -> CredentialPair {
        CredentialPair {
            access_token: "access-abc".to_string(),
            refresh_token: "refresh-xyz".to_string(),
            expiry: Utc.with_ymd_and_hms(2030, 6, 1, 8, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_expires_within_grace_window() {
        let pair = sample_pair();
        let grace = Duration::seconds(60);

        assert!(!pair.expires_within(grace, pair.expiry - Duration::seconds(61)));
        assert!(pair.expires_within(grace, pair.expiry - Duration::seconds(60)));
        assert!(pair.expires_within(grace, pair.expiry - Duration::seconds(10)));
        assert!(pair.expires_within(grace, pair.expiry + Duration::seconds(1)));
    }

    #[test]
    fn test_is_expired() {
        let pair = sample_pair();
        assert!(!pair.is_expired(pair.expiry - Duration::seconds(1)));
        assert!(pair.is_expired(pair.expiry));
        assert_eq!(
            pair.time_until_expiry(pair.expiry - Duration::minutes(5)),
            Duration::minutes(5)
        );
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", sample_pair());
        assert!(!rendered.contains("access-abc"));
        assert!(!rendered.contains("refresh-xyz"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.read().unwrap().is_none());

        let pair = sample_pair();
        store.save(&pair).unwrap();
        assert_eq!(store.read().unwrap(), Some(pair.clone()));

        let replacement = CredentialPair {
            access_token: "access-2".to_string(),
            ..pair
        };
        store.save(&replacement).unwrap();
        assert_eq!(store.read().unwrap(), Some(replacement));
    }

    #[test]
    fn test_memory_store_clear_is_idempotent() {
        let store = MemoryCredentialStore::with_pair(sample_pair());
        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_keyring_store_round_trip_with_mock_backend() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let store = KeyringCredentialStore::new("falowen-session-test", "student").unwrap();

        assert!(store.read().unwrap().is_none());
        store.clear().unwrap();

        let pair = sample_pair();
        store.save(&pair).unwrap();
        assert_eq!(store.read().unwrap(), Some(pair));

        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
    }
}
