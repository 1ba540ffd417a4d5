//! Session and credential management.
//!
//! This module provides:
//! - `StorageGate`: suspends work until protected storage is readable
//! - `CredentialStore`: durable storage for the credential pair (keychain,
//!   encrypted file or memory)
//! - `SessionController`: bootstrap, refresh, retry, login and logout
//!
//! The stored pair survives every failure except an explicit 401 from the
//! refresh endpoint or a user logout.

pub mod credentials;
pub mod file_store;
pub mod gate;
pub mod session;

pub use credentials::{
    CredentialPair, CredentialStore, KeyringCredentialStore, MemoryCredentialStore, StoreError,
};
pub use file_store::EncryptedFileCredentialStore;
pub use gate::{
    AlwaysAvailable, FlagAvailability, KeyringAvailability, StorageAvailability, StorageGate,
};
pub use session::{
    RefreshOutcome, RefreshPolicy, SessionController, SessionControllerBuilder, SessionError,
    SessionPhase, SessionState,
};
