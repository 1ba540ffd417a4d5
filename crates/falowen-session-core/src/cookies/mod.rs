//! Cookie bridge between an embedded web login surface and native requests.
//!
//! When the web view reaches the "login finished" page, every cookie it holds
//! is copied into the `reqwest` jar shared by the auth client and the session
//! controller, so native calls carry the web session from then on.

pub mod bridge;

pub use bridge::{CookieBridge, EmbeddedCookieSource, WebCookie};
