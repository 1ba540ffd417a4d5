//! Session bootstrap and token refresh for the Falowen classroom apps.
//!
//! The crate is split the same way the protocol is:
//! - `auth`: storage gate, credential stores and the session controller
//! - `api`: the login/refresh HTTP client and its error classification
//! - `cookies`: the bridge from an embedded web view into the native cookie jar
//! - `config`: persisted settings and the derived refresh policy
//! - `clock`: injectable wall clock used for every expiry decision

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod cookies;

pub use api::{AuthApi, AuthError, HttpAuthClient, RefreshGrant};
pub use auth::{
    CredentialPair, CredentialStore, RefreshOutcome, RefreshPolicy, SessionController,
    SessionError, SessionPhase, SessionState, StorageGate, StoreError,
};
pub use clock::{Clock, SystemClock};
pub use config::{RefreshTransport, SessionConfig, StoreBackend};
pub use cookies::{CookieBridge, EmbeddedCookieSource, WebCookie};
