use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::cookie::Jar;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::config::SessionConfig;

/// `Expires` attribute format (IMF-fixdate).
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A cookie as reported by the embedded web view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebCookie {
    pub name: String,
    pub value: String,
    /// `None` means host-only for the page that set it.
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    /// `None` for session cookies.
    pub expires: Option<DateTime<Utc>>,
}

impl WebCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            expires: None,
        }
    }

    /// Render as a `Set-Cookie` header value.
    pub fn to_set_cookie(&self) -> String {
        let mut header = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            header.push_str("; Domain=");
            header.push_str(domain);
        }
        if let Some(path) = &self.path {
            header.push_str("; Path=");
            header.push_str(path);
        }
        if let Some(expires) = &self.expires {
            header.push_str("; Expires=");
            header.push_str(&expires.format(HTTP_DATE_FORMAT).to_string());
        }
        if self.secure {
            header.push_str("; Secure");
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        header
    }

    /// URL the cookie is recorded against in the native jar.
    fn target_url(&self, origin: &Url) -> Url {
        let Some(domain) = &self.domain else {
            return origin.clone();
        };
        let scheme = if self.secure { "https" } else { origin.scheme() };
        let host = domain.trim_start_matches('.');
        let path = self.path.as_deref().unwrap_or("/");
        Url::parse(&format!("{}://{}{}", scheme, host, path)).unwrap_or_else(|_| origin.clone())
    }
}

/// Snapshot access to the embedded web view's cookie jar.
pub trait EmbeddedCookieSource {
    fn cookies(&self) -> Vec<WebCookie>;
}

impl EmbeddedCookieSource for Vec<WebCookie> {
    fn cookies(&self) -> Vec<WebCookie> {
        self.clone()
    }
}

pub struct CookieBridge {
    jar: Arc<Jar>,
    origin: Url,
    completion_path: String,
}

impl CookieBridge {
    pub fn new(jar: Arc<Jar>, origin: Url, completion_path: impl Into<String>) -> Self {
        Self {
            jar,
            origin,
            completion_path: completion_path.into(),
        }
    }

    pub fn from_config(config: &SessionConfig, jar: Arc<Jar>) -> Result<Self> {
        let origin = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid base URL: {}", config.base_url))?;
        Ok(Self::new(jar, origin, config.auth_completion_path.clone()))
    }

    pub fn jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    /// True when `url` is the page the web login lands on once it succeeds.
    pub fn is_completion(&self, url: &Url) -> bool {
        url.host_str() == self.origin.host_str()
            && url.path().trim_end_matches('/') == self.completion_path.trim_end_matches('/')
    }

    /// Navigation hook for the embedded surface. Copies cookies only on the
    /// completion page and returns how many were copied.
    ///
    /// Runs synchronously: the jar is up to date when this returns.
    pub fn on_navigation(&self, url: &Url, source: &dyn EmbeddedCookieSource) -> usize {
        if !self.is_completion(url) {
            return 0;
        }
        info!(path = url.path(), "Web login completed, bridging cookies");
        self.sync(source)
    }

    /// Copy every cookie from `source` into the native jar.
    pub fn sync(&self, source: &dyn EmbeddedCookieSource) -> usize {
        let cookies = source.cookies();
        for cookie in &cookies {
            let url = cookie.target_url(&self.origin);
            self.jar.add_cookie_str(&cookie.to_set_cookie(), &url);
        }
        debug!(count = cookies.len(), "Copied web view cookies into native jar");
        cookies.len()
    }
}
