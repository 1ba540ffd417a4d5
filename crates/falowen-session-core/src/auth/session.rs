//! Session controller.
//!
//! Owns the observable session state and coordinates the storage gate, the
//! credential store and the auth client:
//! - `bootstrap` on launch and on every return to foreground
//! - proactive refresh once the access token is inside the grace window
//! - bounded exponential-backoff retries for transient failures
//! - a periodic refresh task that keeps idle sessions alive
//! - explicit `login` / `logout`
//!
//! Only an authoritative 401 from the refresh endpoint clears the stored pair.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::Duration;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialPair, CredentialStore, StoreError};
use super::gate::StorageGate;
use crate::api::{AuthApi, AuthError, RefreshGrant};
use crate::clock::{Clock, SystemClock};
use crate::config::{RefreshTransport, SessionConfig};

const SESSION_EXPIRED_MESSAGE: &str = "Session expired, please sign in again";

/// How often `wait_for_pending_retry` rechecks the retry task
const RETRY_WAIT_POLL: StdDuration = StdDuration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionPhase {
    /// No bootstrap has completed yet. Observably the same as `LoggedOut`.
    Idle,
    Bootstrapping,
    Authenticated { needs_refresh: bool },
    LoggedOut,
}

/// What the presentation layer observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionState {
    pub phase: SessionPhase,
    pub authenticated: bool,
    pub needs_login: bool,
    pub error_message: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            authenticated: false,
            needs_login: false,
            error_message: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized - credentials rejected by the server")]
    Unauthorized,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Credential storage fault: {0}")]
    StorageFault(String),

    #[error("Not authenticated")]
    NotAuthenticated,
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => SessionError::Unauthorized,
            AuthError::Transient(detail) => SessionError::Transient(detail),
            AuthError::Validation(detail) => SessionError::Validation(detail),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::StorageFault(err.to_string())
    }
}

/// Result of one expiry check / refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Access token is outside the grace window; nothing sent.
    Fresh,
    Refreshed,
    /// Server returned 401; credentials cleared.
    Rejected,
    /// Transient failure; session kept, bounded retry scheduled.
    Deferred,
    /// Nothing to do (no stored pair, or another refresh owns the session).
    Skipped,
    /// Local storage failed; session state unchanged.
    Fault,
}

/// Timing and transport knobs of the refresh protocol.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub grace_window: Duration,
    pub retry_base_delay: StdDuration,
    pub max_retries: u32,
    pub cadence: StdDuration,
    pub transport: RefreshTransport,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        SessionConfig::default().refresh_policy()
    }
}

impl RefreshPolicy {
    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base, ...
    pub fn backoff(&self, retry: u32) -> StdDuration {
        let exponent = retry.saturating_sub(1).min(16);
        self.retry_base_delay.saturating_mul(1u32 << exponent)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Holds a busy flag (bootstrap pass, refresh call) and resets it however
/// the holder ends, including when its task is aborted.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ControllerInner {
    store: Arc<dyn CredentialStore>,
    api: Arc<dyn AuthApi>,
    gate: StorageGate,
    clock: Arc<dyn Clock>,
    http: Client,
    policy: RefreshPolicy,
    state: watch::Sender<SessionState>,
    bootstrapping: AtomicBool,
    /// Set while a call to the refresh endpoint is outstanding. At most one
    /// refresh is ever in flight; refresh tokens rotate on use.
    refreshing: AtomicBool,
    /// Bumped whenever the stored identity changes hands (login, logout,
    /// rejection) so a refresh that started earlier cannot resurrect it.
    epoch: AtomicU64,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    schedule_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.schedule_task).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.retry_task).take() {
            handle.abort();
        }
    }
}

pub struct SessionControllerBuilder {
    store: Arc<dyn CredentialStore>,
    api: Arc<dyn AuthApi>,
    policy: RefreshPolicy,
    gate: Option<StorageGate>,
    clock: Option<Arc<dyn Clock>>,
    http: Option<Client>,
}

impl SessionControllerBuilder {
    pub fn policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn gate(mut self, gate: StorageGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Client used for `authorized_request`; share the auth client's to keep one cookie jar.
    pub fn http_client(mut self, http: Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> SessionController {
        let (state, _) = watch::channel(SessionState::default());
        SessionController {
            inner: Arc::new(ControllerInner {
                store: self.store,
                api: self.api,
                gate: self.gate.unwrap_or_else(StorageGate::always_available),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                http: self.http.unwrap_or_default(),
                policy: self.policy,
                state,
                bootstrapping: AtomicBool::new(false),
                refreshing: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                retry_task: Mutex::new(None),
                schedule_task: Mutex::new(None),
            }),
        }
    }
}

/// Session state machine.
/// Clone is cheap - all clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn builder(
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn AuthApi>,
    ) -> SessionControllerBuilder {
        SessionControllerBuilder {
            store,
            api,
            policy: RefreshPolicy::default(),
            gate: None,
            clock: None,
            http: None,
        }
    }

    // ===== Observable state =====

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().authenticated
    }

    pub fn needs_login(&self) -> bool {
        self.inner.state.borrow().needs_login
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.state.borrow().error_message.clone()
    }

    fn update(&self, modify: impl FnOnce(&mut SessionState)) {
        self.inner.state.send_modify(modify);
    }

    fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // ===== Bootstrap =====

    /// Restore the session from storage and refresh it if it is about to expire.
    ///
    /// Returns `false` without side effects when another bootstrap pass is
    /// already in flight.
    pub async fn bootstrap(&self) -> bool {
        let Some(_guard) = FlagGuard::acquire(&self.inner.bootstrapping) else {
            debug!("Bootstrap already in flight, dropping trigger");
            return false;
        };

        let previous_phase = self.state().phase;
        self.update(|s| s.phase = SessionPhase::Bootstrapping);

        self.inner.gate.wait_until_available().await;

        let stored = match self.inner.store.read() {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Failed to read stored credentials");
                self.update(|s| {
                    s.phase = previous_phase;
                    s.error_message = Some(format!("Could not read saved session: {}", e));
                });
                return true;
            }
        };

        match stored {
            None => {
                info!("No stored credentials");
                self.update(|s| {
                    s.phase = SessionPhase::LoggedOut;
                    s.authenticated = false;
                    s.needs_login = false;
                });
            }
            Some(pair) => {
                info!("Stored credentials found, restoring session");
                self.update(|s| {
                    s.phase = SessionPhase::Authenticated {
                        needs_refresh: false,
                    };
                    s.authenticated = true;
                    s.needs_login = false;
                });
                self.refresh_pair_if_due(pair).await;
            }
        }
        true
    }

    // ===== Refresh =====

    /// Run the expiry check and, if due, a refresh against the stored pair.
    ///
    /// This is what the periodic task runs. It is skipped while a bootstrap
    /// pass, a retry sequence or another refresh call already owns the refresh.
    pub async fn refresh_if_due(&self) -> RefreshOutcome {
        if self.inner.bootstrapping.load(Ordering::Acquire) {
            debug!("Bootstrap in flight, skipping refresh pass");
            return RefreshOutcome::Skipped;
        }
        if self.retry_pending() {
            debug!("Retry sequence pending, skipping refresh pass");
            return RefreshOutcome::Skipped;
        }

        self.inner.gate.wait_until_available().await;

        match self.inner.store.read() {
            Ok(Some(pair)) => self.refresh_pair_if_due(pair).await,
            Ok(None) => {
                debug!("No stored credentials, nothing to refresh");
                RefreshOutcome::Skipped
            }
            Err(e) => {
                error!(error = %e, "Failed to read stored credentials for refresh");
                self.update(|s| {
                    s.error_message = Some(format!("Could not read saved session: {}", e));
                });
                RefreshOutcome::Fault
            }
        }
    }

    async fn refresh_pair_if_due(&self, pair: CredentialPair) -> RefreshOutcome {
        let now = self.inner.clock.now();
        if !pair.expires_within(self.inner.policy.grace_window, now) {
            debug!(
                expires_in_secs = pair.time_until_expiry(now).num_seconds(),
                "Access token still fresh"
            );
            self.update(|s| {
                if s.authenticated {
                    s.phase = SessionPhase::Authenticated {
                        needs_refresh: false,
                    };
                }
            });
            return RefreshOutcome::Fresh;
        }

        self.update(|s| {
            if s.authenticated {
                s.phase = SessionPhase::Authenticated {
                    needs_refresh: true,
                };
            }
        });

        if self.retry_pending() {
            debug!("Retry sequence owns the refresh, deferring");
            return RefreshOutcome::Skipped;
        }
        let Some(_refreshing) = FlagGuard::acquire(&self.inner.refreshing) else {
            debug!("Refresh already in flight, deferring");
            return RefreshOutcome::Skipped;
        };

        let epoch = self.current_epoch();
        match self.request_refresh(&pair).await {
            Ok(renewed) => self.accept_renewed(renewed, epoch),
            Err(AuthError::Unauthorized) => self.reject_session(epoch),
            Err(e) => {
                warn!(error = %e, "Refresh failed, keeping session and scheduling retry");
                self.schedule_retry();
                RefreshOutcome::Deferred
            }
        }
    }

    async fn request_refresh(&self, pair: &CredentialPair) -> Result<CredentialPair, AuthError> {
        let grant = match self.inner.policy.transport {
            RefreshTransport::Body => RefreshGrant::Token(&pair.refresh_token),
            RefreshTransport::Cookie => RefreshGrant::Cookie,
        };
        self.inner.api.refresh(grant).await
    }

    fn accept_renewed(&self, renewed: CredentialPair, epoch: u64) -> RefreshOutcome {
        if self.current_epoch() != epoch {
            debug!("Session changed while refreshing, discarding renewed credentials");
            return RefreshOutcome::Skipped;
        }

        if let Err(e) = self.inner.store.save(&renewed) {
            error!(error = %e, "Failed to save refreshed credentials");
            self.update(|s| {
                s.error_message = Some(format!("Could not save refreshed session: {}", e));
            });
            return RefreshOutcome::Fault;
        }

        info!(expiry = %renewed.expiry, "Session refreshed");
        self.update(|s| {
            s.phase = SessionPhase::Authenticated {
                needs_refresh: false,
            };
            s.authenticated = true;
            s.needs_login = false;
            s.error_message = None;
        });
        RefreshOutcome::Refreshed
    }

    fn reject_session(&self, epoch: u64) -> RefreshOutcome {
        if self.current_epoch() != epoch {
            debug!("Session changed while refreshing, ignoring rejection of old credentials");
            return RefreshOutcome::Skipped;
        }

        warn!("Refresh token rejected by server, signing out");
        self.bump_epoch();
        if let Err(e) = self.inner.store.clear() {
            error!(error = %e, "Failed to clear rejected credentials");
        }
        self.update(|s| {
            s.phase = SessionPhase::LoggedOut;
            s.authenticated = false;
            s.needs_login = true;
            s.error_message = Some(SESSION_EXPIRED_MESSAGE.to_string());
        });
        RefreshOutcome::Rejected
    }

    // ===== Retry =====

    fn retry_pending(&self) -> bool {
        lock(&self.inner.retry_task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn schedule_retry(&self) {
        if self.inner.policy.max_retries == 0 {
            return;
        }
        let mut slot = lock(&self.inner.retry_task);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Retry sequence already pending");
            return;
        }
        let controller = self.clone();
        *slot = Some(tokio::spawn(async move { controller.run_retries().await }));
    }

    async fn run_retries(&self) {
        let policy = &self.inner.policy;
        let epoch = self.current_epoch();

        for retry in 1..=policy.max_retries {
            let delay = policy.backoff(retry);
            debug!(retry, delay_ms = delay.as_millis() as u64, "Waiting before refresh retry");
            tokio::time::sleep(delay).await;

            self.inner.gate.wait_until_available().await;
            let pair = match self.inner.store.read() {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    debug!("Credentials cleared, abandoning retries");
                    return;
                }
                Err(e) => {
                    error!(retry, error = %e, "Failed to read credentials for retry");
                    continue;
                }
            };
            if !pair.expires_within(policy.grace_window, self.inner.clock.now()) {
                debug!("Credentials renewed elsewhere, abandoning retries");
                return;
            }
            let Some(_refreshing) = FlagGuard::acquire(&self.inner.refreshing) else {
                debug!("Another refresh is in flight, abandoning retries");
                return;
            };

            match self.request_refresh(&pair).await {
                Ok(renewed) => {
                    self.accept_renewed(renewed, epoch);
                    return;
                }
                Err(AuthError::Unauthorized) => {
                    self.reject_session(epoch);
                    return;
                }
                Err(e) => {
                    warn!(
                        retry,
                        max_retries = policy.max_retries,
                        error = %e,
                        "Refresh retry failed"
                    );
                }
            }
        }

        warn!(
            max_retries = policy.max_retries,
            "Refresh retries exhausted, waiting for next scheduled refresh"
        );
    }

    /// Wait for an outstanding retry sequence, if any, to finish.
    ///
    /// The task stays registered while waiting, so it still blocks other
    /// refreshes and can still be cancelled by login, logout or `shutdown`.
    pub async fn wait_for_pending_retry(&self) {
        while self.retry_pending() {
            tokio::time::sleep(RETRY_WAIT_POLL).await;
        }

        let finished = {
            let mut slot = lock(&self.inner.retry_task);
            if slot.as_ref().is_some_and(|handle| handle.is_finished()) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(handle) = finished {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Refresh retry task failed");
                }
            }
        }
    }

    fn cancel_retry(&self) {
        if let Some(handle) = lock(&self.inner.retry_task).take() {
            handle.abort();
        }
    }

    // ===== Periodic refresh =====

    /// Start (or restart) the periodic refresh task at the policy cadence.
    ///
    /// The task holds only a weak reference, so it ends on its own once the
    /// last controller handle is dropped.
    pub fn start_periodic_refresh(&self) {
        let cadence = self.inner.policy.cadence.max(StdDuration::from_secs(1));
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let first_tick = tokio::time::Instant::now() + cadence;
            let mut ticker = tokio::time::interval_at(first_tick, cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let controller = SessionController { inner };
                let outcome = controller.refresh_if_due().await;
                debug!(?outcome, "Scheduled refresh pass complete");
            }
        });

        if let Some(previous) = lock(&self.inner.schedule_task).replace(handle) {
            previous.abort();
        }
        info!(cadence_secs = cadence.as_secs(), "Periodic refresh scheduled");
    }

    pub fn stop_periodic_refresh(&self) {
        if let Some(handle) = lock(&self.inner.schedule_task).take() {
            handle.abort();
            debug!("Periodic refresh stopped");
        }
    }

    pub fn is_periodic_refresh_running(&self) -> bool {
        lock(&self.inner.schedule_task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Tear down the periodic task and any pending retry.
    pub fn shutdown(&self) {
        self.stop_periodic_refresh();
        self.cancel_retry();
        info!("Session controller shut down");
    }

    // ===== Login / logout =====

    pub async fn login(&self, identifier: &str, password: &str) -> Result<(), SessionError> {
        let identifier = identifier.trim();
        if identifier.is_empty() || password.is_empty() {
            let err = SessionError::Validation("Identifier and password are required".to_string());
            self.update(|s| {
                s.phase = SessionPhase::LoggedOut;
                s.authenticated = false;
                s.error_message = Some(err.to_string());
            });
            return Err(err);
        }

        let pair = match self.inner.api.login(identifier, password).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Login failed");
                let message = login_failure_message(&e);
                self.update(|s| {
                    s.phase = SessionPhase::LoggedOut;
                    s.authenticated = false;
                    s.error_message = Some(message);
                });
                return Err(e.into());
            }
        };

        self.store_new_session(pair).await?;
        info!("Login successful");
        Ok(())
    }

    /// Exchange a bridged web session cookie for a stored credential pair.
    pub async fn adopt_cookie_session(&self) -> Result<(), SessionError> {
        let Some(_refreshing) = FlagGuard::acquire(&self.inner.refreshing) else {
            return Err(SessionError::Transient(
                "a session refresh is already in progress".to_string(),
            ));
        };
        let epoch = self.current_epoch();
        match self.inner.api.refresh(RefreshGrant::Cookie).await {
            Ok(pair) => {
                self.store_new_session(pair).await?;
                info!("Web session adopted");
                Ok(())
            }
            Err(AuthError::Unauthorized) => {
                self.reject_session(epoch);
                Err(SessionError::Unauthorized)
            }
            Err(e) => {
                warn!(error = %e, "Could not adopt web session");
                self.update(|s| {
                    s.error_message =
                        Some("Unable to reach the server. Please try again.".to_string());
                });
                Err(e.into())
            }
        }
    }

    async fn store_new_session(&self, pair: CredentialPair) -> Result<(), SessionError> {
        self.inner.gate.wait_until_available().await;
        if let Err(e) = self.inner.store.save(&pair) {
            error!(error = %e, "Failed to save credentials");
            let err = SessionError::from(e);
            self.update(|s| s.error_message = Some(err.to_string()));
            return Err(err);
        }

        self.cancel_retry();
        self.bump_epoch();
        self.update(|s| {
            s.phase = SessionPhase::Authenticated {
                needs_refresh: false,
            };
            s.authenticated = true;
            s.needs_login = false;
            s.error_message = None;
        });
        Ok(())
    }

    /// Clear the local session unconditionally, then revoke it server side.
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.cancel_retry();
        self.bump_epoch();
        self.inner.gate.wait_until_available().await;

        let previous = self.inner.store.read().ok().flatten();
        let cleared = self.inner.store.clear();
        if let Err(e) = &cleared {
            error!(error = %e, "Failed to clear credentials on logout");
        }

        self.update(|s| {
            s.phase = SessionPhase::LoggedOut;
            s.authenticated = false;
            s.needs_login = false;
            s.error_message = cleared
                .as_ref()
                .err()
                .map(|e| format!("Could not remove saved session: {}", e));
        });
        info!("Logged out");

        if let Some(pair) = previous {
            if let Err(e) = self.inner.api.revoke(&pair.refresh_token).await {
                warn!(error = %e, "Server-side logout failed");
            }
        }

        cleared.map_err(SessionError::from)
    }

    // ===== Outgoing requests =====

    /// Build a request carrying the current access token as a bearer credential.
    pub fn authorized_request(
        &self,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, SessionError> {
        let pair = self
            .inner
            .store
            .read()?
            .ok_or(SessionError::NotAuthenticated)?;
        Ok(self.inner.http.request(method, url).bearer_auth(&pair.access_token))
    }
}

fn login_failure_message(err: &AuthError) -> String {
    match err {
        AuthError::Unauthorized => "Invalid identifier or password".to_string(),
        AuthError::Validation(detail) => format!("Login rejected: {}", detail),
        AuthError::Transient(_) => "Unable to reach the server. Please try again.".to_string(),
    }
}
