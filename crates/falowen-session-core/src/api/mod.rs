//! Auth server client module.
//!
//! This module provides the `AuthApi` seam the session controller talks to,
//! and `HttpAuthClient`, its implementation against the Falowen auth
//! endpoints (`/auth/login`, `/auth/refresh`, `/auth/logout`).
//!
//! Every failure is classified into `AuthError`: a 401 is an authoritative
//! rejection, everything else is transient.

pub mod client;
pub mod error;

pub use client::{AuthApi, HttpAuthClient, RefreshGrant};
pub use error::AuthError;
