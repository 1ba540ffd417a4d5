//! HTTP client for the Falowen auth endpoints.
//!
//! The client shares one `reqwest::cookie::Jar` with the rest of the native
//! networking stack, so `Set-Cookie` headers from login/refresh and cookies
//! copied in by the [`CookieBridge`](crate::cookies::CookieBridge) ride along
//! on every request automatically.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::cookie::Jar;
use reqwest::{header, Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::AuthError;
use crate::auth::CredentialPair;
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";

/// What the refresh call presents to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshGrant<'a> {
    /// Refresh token sent in the JSON body (native token pair flow).
    Token(&'a str),
    /// Session cookie already present in the shared jar (web flow).
    Cookie,
}

/// The network seam used by the session controller.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange user credentials for a fresh pair.
    async fn login(&self, identifier: &str, password: &str) -> Result<CredentialPair, AuthError>;

    /// Exchange a refresh token or session cookie for a renewed pair.
    async fn refresh(&self, grant: RefreshGrant<'_>) -> Result<CredentialPair, AuthError>;

    /// Best-effort server side revocation on logout.
    async fn revoke(&self, _refresh_token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Token payload returned by login and refresh.
///
/// The server has shipped two shapes: camelCase with an absolute `expiry`,
/// and snake_case with a relative `expires_in`. Both are accepted.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(alias = "refreshToken")]
    refresh_token: String,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_pair(self, now: DateTime<Utc>) -> Result<CredentialPair, AuthError> {
        if self.access_token.is_empty() || self.refresh_token.is_empty() {
            return Err(AuthError::Transient(
                "malformed response: empty token".to_string(),
            ));
        }
        let expiry = match (self.expiry, self.expires_in) {
            (Some(expiry), _) => expiry,
            (None, Some(secs)) => Duration::try_seconds(secs)
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .ok_or_else(|| {
                    AuthError::Transient("malformed response: expiry out of range".to_string())
                })?,
            (None, None) => {
                return Err(AuthError::Transient(
                    "malformed response: missing expiry".to_string(),
                ))
            }
        };
        Ok(CredentialPair {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expiry,
        })
    }
}

/// Auth client for the Falowen backend.
/// Clone is cheap - reqwest::Client and the jar are reference counted.
#[derive(Clone)]
pub struct HttpAuthClient {
    client: Client,
    base_url: Url,
    jar: Arc<Jar>,
    clock: Arc<dyn Clock>,
}

impl HttpAuthClient {
    /// Create a client with its own empty cookie jar
    pub fn new(config: &SessionConfig) -> Result<Self> {
        Self::with_jar(config, Arc::new(Jar::default()))
    }

    /// Create a client backed by an existing shared cookie jar
    pub fn with_jar(config: &SessionConfig, jar: Arc<Jar>) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid auth base URL: {}", config.base_url))?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .cookie_provider(jar.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            jar,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The shared native cookie jar
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    /// The underlying HTTP client, sharing this client's pool and jar
    pub fn http_client(&self) -> Client {
        self.client.clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::Transient(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn read_pair(&self, response: Response) -> Result<CredentialPair, AuthError> {
        let body = response.text().await.map_err(AuthError::from_transport)?;
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::Transient(format!("malformed response: {}", e)))?;
        parsed.into_pair(self.clock.now())
    }
}

#[async_trait]
impl AuthApi for HttpAuthClient {
    async fn login(&self, identifier: &str, password: &str) -> Result<CredentialPair, AuthError> {
        let url = self.endpoint(LOGIN_PATH)?;

        let response = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest {
                identifier,
                password,
            })
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::from_login_status(status, &body));
        }

        debug!("Login accepted");
        self.read_pair(response).await
    }

    async fn refresh(&self, grant: RefreshGrant<'_>) -> Result<CredentialPair, AuthError> {
        let url = self.endpoint(REFRESH_PATH)?;

        let request = match grant {
            RefreshGrant::Token(token) => self
                .client
                .post(url)
                .json(&RefreshRequest { refresh_token: token }),
            RefreshGrant::Cookie => self.client.get(url),
        };

        let response = request
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::from_status(status, &body));
        }

        self.read_pair(response).await
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), AuthError> {
        let url = self.endpoint(LOGOUT_PATH)?;

        let response = self
            .client
            .post(url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Server rejected logout");
            Err(AuthError::from_status(status, &body))
        }
    }
}
