//! Session configuration management.
//!
//! Settings cover the auth server location, which refresh transport the
//! platform uses (token body for the native app, cookie for the web view),
//! where credentials are stored, and the timing knobs of the refresh protocol.
//!
//! Configuration is stored at `~/.config/falowen-session/config.json`.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::RefreshPolicy;

/// Application name used for config/data directory paths
const APP_NAME: &str = "falowen-session";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Encrypted credential file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.enc";

const DEFAULT_BASE_URL: &str = "https://www.falowen.app";

/// Seconds before expiry at which a stored pair is considered due for refresh.
const DEFAULT_GRACE_WINDOW_SECS: u64 = 60;

const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Periodic refresh never runs less often than daily.
const DEFAULT_MAX_REFRESH_INTERVAL_SECS: u64 = 60 * 60 * 24;

/// Session cookie max-age issued by the auth server (30 days).
const DEFAULT_CREDENTIAL_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 30;

const DEFAULT_STORAGE_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_AUTH_COMPLETION_PATH: &str = "/auth/complete";

/// How the refresh token travels to `/auth/refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTransport {
    /// JSON body field, used by the native app's token pair flow.
    #[default]
    Body,
    /// Session cookie carried by the shared cookie jar, used by the web flow.
    Cookie,
}

impl std::str::FromStr for RefreshTransport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "body" => Ok(Self::Body),
            "cookie" => Ok(Self::Cookie),
            other => Err(anyhow::anyhow!("Unknown refresh transport: {}", other)),
        }
    }
}

/// Where the credential pair is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Keyring,
    EncryptedFile,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keyring" => Ok(Self::Keyring),
            "encrypted_file" | "file" => Ok(Self::EncryptedFile),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown store backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub base_url: String,
    pub refresh_transport: RefreshTransport,
    pub store_backend: StoreBackend,
    pub keyring_service: String,
    pub account: String,
    pub grace_window_secs: u64,
    pub retry_base_delay_ms: u64,
    pub max_retries: u32,
    pub max_refresh_interval_secs: u64,
    pub credential_max_age_secs: u64,
    pub storage_poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    /// Navigation path that marks a finished login inside the embedded web view.
    pub auth_completion_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_transport: RefreshTransport::default(),
            store_backend: StoreBackend::default(),
            keyring_service: APP_NAME.to_string(),
            account: "default".to_string(),
            grace_window_secs: DEFAULT_GRACE_WINDOW_SECS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_refresh_interval_secs: DEFAULT_MAX_REFRESH_INTERVAL_SECS,
            credential_max_age_secs: DEFAULT_CREDENTIAL_MAX_AGE_SECS,
            storage_poll_interval_ms: DEFAULT_STORAGE_POLL_INTERVAL_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            auth_completion_path: DEFAULT_AUTH_COMPLETION_PATH.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `FALOWEN_*` environment overrides on top of the loaded file.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FALOWEN_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(transport) = std::env::var("FALOWEN_REFRESH_TRANSPORT") {
            self.refresh_transport = transport.parse()?;
        }
        if let Ok(backend) = std::env::var("FALOWEN_STORE_BACKEND") {
            self.store_backend = backend.parse()?;
        }
        if let Ok(account) = std::env::var("FALOWEN_ACCOUNT") {
            self.account = account;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Location of the encrypted credential file, scoped per account.
    pub fn credentials_path(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(&self.account).join(CREDENTIALS_FILE))
    }

    pub fn request_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.request_timeout_secs)
    }

    pub fn storage_poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.storage_poll_interval_ms)
    }

    /// Periodic refresh cadence: daily, or half the credential max-age if that is shorter.
    pub fn refresh_cadence(&self) -> StdDuration {
        let half_max_age = self.credential_max_age_secs / 2;
        StdDuration::from_secs(self.max_refresh_interval_secs.min(half_max_age).max(1))
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            grace_window: chrono::Duration::seconds(self.grace_window_secs as i64),
            retry_base_delay: StdDuration::from_millis(self.retry_base_delay_ms),
            max_retries: self.max_retries,
            cadence: self.refresh_cadence(),
            transport: self.refresh_transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_protocol_constants() {
        let policy = SessionConfig::default().refresh_policy();
        assert_eq!(policy.grace_window, chrono::Duration::seconds(60));
        assert_eq!(policy.retry_base_delay, StdDuration::from_secs(1));
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.transport, RefreshTransport::Body);
    }

    #[test]
    fn test_refresh_cadence_is_daily_for_long_lived_credentials() {
        let config = SessionConfig::default();
        assert_eq!(config.refresh_cadence(), StdDuration::from_secs(86_400));
    }

    #[test]
    fn test_refresh_cadence_uses_half_max_age_when_shorter() {
        let config = SessionConfig {
            credential_max_age_secs: 3600,
            ..SessionConfig::default()
        };
        assert_eq!(config.refresh_cadence(), StdDuration::from_secs(1800));
    }

    #[test]
    fn test_partial_config_file_falls_back_to_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"refresh_transport": "cookie", "max_retries": 5}"#)
                .expect("partial config should parse");
        assert_eq!(config.refresh_transport, RefreshTransport::Cookie);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.grace_window_secs, 60);
        assert_eq!(config.base_url, "https://www.falowen.app");
    }

    #[test]
    fn test_parse_transport_and_backend() {
        assert_eq!("cookie".parse::<RefreshTransport>().unwrap(), RefreshTransport::Cookie);
        assert_eq!(" BODY ".parse::<RefreshTransport>().unwrap(), RefreshTransport::Body);
        assert!("carrier-pigeon".parse::<RefreshTransport>().is_err());

        assert_eq!("encrypted-file".parse::<StoreBackend>().unwrap(), StoreBackend::EncryptedFile);
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("floppy".parse::<StoreBackend>().is_err());
    }
}
