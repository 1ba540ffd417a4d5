use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keyring::Entry;
use tracing::{debug, info};

/// Poll interval while waiting for protected storage to unlock
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Reports whether durable credential storage can be accessed right now.
pub trait StorageAvailability: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Storage that is never locked (memory, plain files).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAvailable;

impl StorageAvailability for AlwaysAvailable {
    fn is_available(&self) -> bool {
        true
    }
}

/// Availability driven by the host, e.g. from a "protected data became
/// available" notification after first unlock.
#[derive(Debug, Default)]
pub struct FlagAvailability {
    available: AtomicBool,
}

impl FlagAvailability {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

impl StorageAvailability for FlagAvailability {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

/// Checks the OS keychain by reading the session's own entry.
pub struct KeyringAvailability {
    entry: Option<Entry>,
}

impl KeyringAvailability {
    pub fn new(service: &str, account: &str) -> Self {
        Self {
            entry: Entry::new(service, account).ok(),
        }
    }
}

impl StorageAvailability for KeyringAvailability {
    fn is_available(&self) -> bool {
        let Some(entry) = &self.entry else {
            return false;
        };
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => true,
            Err(keyring::Error::NoStorageAccess(_)) | Err(keyring::Error::PlatformFailure(_)) => {
                false
            }
            Err(_) => true,
        }
    }
}

/// Suspends callers until credential storage is available.
///
/// There is no upper bound on the wait: locked storage is expected to unlock
/// on its own, and nothing may touch the store before it does.
#[derive(Clone)]
pub struct StorageGate {
    availability: Arc<dyn StorageAvailability>,
    poll_interval: Duration,
}

impl StorageGate {
    pub fn new(availability: Arc<dyn StorageAvailability>, poll_interval: Duration) -> Self {
        Self {
            availability,
            poll_interval,
        }
    }

    pub fn always_available() -> Self {
        Self::new(Arc::new(AlwaysAvailable), DEFAULT_POLL_INTERVAL)
    }

    pub fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    pub async fn wait_until_available(&self) {
        if self.availability.is_available() {
            return;
        }

        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "Credential storage unavailable, waiting"
        );
        let mut polls: u64 = 0;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            polls += 1;
            if self.availability.is_available() {
                debug!(polls, "Credential storage became available");
                return;
            }
        }
    }
}
