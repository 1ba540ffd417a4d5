//! Encrypted file credential store for hosts without an OS keychain.
//!
//! File layout: magic, salt, nonce, then the XChaCha20-Poly1305 ciphertext
//! of the JSON-encoded pair. The key is derived from a caller-supplied
//! passphrase with Argon2 and a fresh random salt on every save.

use std::path::{Path, PathBuf};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use tracing::debug;

use super::credentials::{CredentialPair, CredentialStore, StoreError};

const MAGIC: &[u8; 4] = b"FSC1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;

pub struct EncryptedFileCredentialStore {
    path: PathBuf,
    passphrase: String,
}

impl EncryptedFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: passphrase.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self, salt: &[u8]) -> Result<XChaCha20Poly1305, StoreError> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| StoreError::Backend(format!("key derivation failed: {}", e)))?;
        XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| StoreError::Backend(format!("failed to create cipher: {}", e)))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CredentialStore for EncryptedFileCredentialStore {
    fn read(&self) -> Result<Option<CredentialPair>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() <= HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(StoreError::Corrupt("unrecognised credential file".to_string()));
        }
        let salt = &bytes[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let nonce = XNonce::from_slice(&bytes[MAGIC.len() + SALT_LEN..HEADER_LEN]);
        let ciphertext = &bytes[HEADER_LEN..];

        let plaintext = self
            .cipher(salt)?
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::Corrupt("wrong passphrase or tampered file".to_string()))?;

        serde_json::from_slice(&plaintext)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let plaintext =
            serde_json::to_vec(pair).map_err(|e| StoreError::Backend(e.to_string()))?;
        let ciphertext = self
            .cipher(&salt)?
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| StoreError::Backend(format!("encryption failed: {}", e)))?;

        let mut contents = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        contents.extend_from_slice(MAGIC);
        contents.extend_from_slice(&salt);
        contents.extend_from_slice(&nonce);
        contents.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename so readers never observe a half-written pair.
        let tmp = self.temp_path();
        std::fs::write(&tmp, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "Credential pair written to encrypted file");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_pair() -> CredentialPair {
        CredentialPair {
            access_token: "access-file".to_string(),
            refresh_token: "refresh-file".to_string(),
            expiry: Utc.with_ymd_and_hms(2031, 1, 15, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileCredentialStore::new(
            dir.path().join("nested").join("credentials.enc"),
            "correct horse",
        );

        assert!(store.read().unwrap().is_none());

        let pair = sample_pair();
        store.save(&pair).unwrap();
        assert_eq!(store.read().unwrap(), Some(pair));
        assert!(!store.temp_path().exists());

        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_file_does_not_contain_plaintext_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileCredentialStore::new(dir.path().join("c.enc"), "pw");
        store.save(&sample_pair()).unwrap();

        let raw = std::fs::read(store.path()).unwrap();
        let raw = String::from_utf8_lossy(&raw);
        assert!(!raw.contains("access-file"));
        assert!(!raw.contains("refresh-file"));
    }

    #[test]
    fn test_wrong_passphrase_is_a_storage_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.enc");
        EncryptedFileCredentialStore::new(&path, "right")
            .save(&sample_pair())
            .unwrap();

        let err = EncryptedFileCredentialStore::new(&path, "wrong")
            .read()
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.enc");
        std::fs::write(&path, b"not a credential file").unwrap();

        let err = EncryptedFileCredentialStore::new(&path, "pw").read().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
