//! Authentication lifecycle
//!
//! Owns the single control-plane session for the identity and drives the
//! unauthenticated → partial → full transitions, TOTP challenges, and the
//! background renewal loop.

use crate::api::ControlError;
use crate::backoff::Backoff;
use crate::client::{ClientInner, OverlayClient, OverlayError};
use crate::events::MfaPrompt;
use crate::metrics::counters;
use chrono::{DateTime, Utc};
use edgelink_proto::{ApiSession, AuthQuery, MfaProvider, Session};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How far ahead of expiry the renewal loop refreshes the api session.
pub(crate) const SESSION_EXPIRY_LEAD: Duration = Duration::from_secs(10);

/// Retry delay after a failed renewal.
pub(crate) const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Authentication states of the control-plane session.
#[derive(Debug, Clone)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    /// Authenticated with outstanding auth queries (e.g. pending TOTP).
    Partial(ApiSession),
    Full(ApiSession),
}

impl AuthState {
    pub fn api_session(&self) -> Option<&ApiSession> {
        match self {
            AuthState::Partial(session) | AuthState::Full(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, AuthState::Full(_))
    }
}

/// Handler invoked for TOTP auth queries raised during authentication.
pub type MfaHandler =
    Arc<dyn Fn(&AuthQuery, MfaResponder) -> Result<(), OverlayError> + Send + Sync>;

/// Cloneable handle for answering a TOTP challenge.
#[derive(Clone)]
pub struct MfaResponder {
    inner: Weak<ClientInner>,
}

impl MfaResponder {
    pub(crate) fn new(inner: &Arc<ClientInner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    /// Submit the TOTP code; completes authentication when no queries remain.
    pub async fn submit(&self, code: &str) -> Result<(), OverlayError> {
        let inner = self.inner.upgrade().ok_or(OverlayError::Closed)?;
        OverlayClient::from_inner(inner).authenticate_mfa(code).await
    }
}

impl OverlayClient {
    /// Current authentication state snapshot.
    pub fn auth_state(&self) -> AuthState {
        self.inner.auth_state.read().unwrap().clone()
    }

    pub(crate) fn api_session(&self) -> Option<ApiSession> {
        self.inner.auth_state.read().unwrap().api_session().cloned()
    }

    pub(crate) fn api_session_token(&self) -> Option<String> {
        self.api_session().map(|session| session.token)
    }

    /// Authenticate, preferring a lightweight refresh of an existing session.
    pub async fn authenticate(&self) -> Result<(), OverlayError> {
        if self.api_session().is_some() {
            debug!("existing api session detected, attempting refresh");
            match self.inner.control.refresh().await {
                Ok(expires_at) => {
                    info!("api session refreshed");
                    self.update_session_expiry(expires_at);
                    return Ok(());
                }
                Err(err) => {
                    info!("api session refresh failed, re-authenticating: {err}");
                }
            }
        }

        self.full_authenticate().await
    }

    /// Drop the current session wholesale and authenticate from scratch.
    pub async fn reauthenticate(&self) -> Result<(), OverlayError> {
        *self.inner.auth_state.write().unwrap() = AuthState::Unauthenticated;
        self.full_authenticate().await
    }

    async fn full_authenticate(&self) -> Result<(), OverlayError> {
        debug!("attempting to authenticate");

        // everything keyed to the old session is now suspect
        self.inner.catalog.clear();
        self.inner.sessions.clear();
        self.set_unauthenticated().await;

        *self.inner.auth_state.write().unwrap() = AuthState::Authenticating;

        let api_session = match self.inner.control.authenticate().await {
            Ok(session) => session,
            Err(err) => {
                *self.inner.auth_state.write().unwrap() = AuthState::Unauthenticated;
                return Err(match err {
                    ControlError::Unauthorized(msg) => OverlayError::Authentication(msg),
                    other => OverlayError::Control(other),
                });
            }
        };

        if !api_session.auth_queries.is_empty() {
            *self.inner.auth_state.write().unwrap() = AuthState::Partial(api_session.clone());
            self.inner.events.auth_state_partial.emit(&api_session);
            for query in &api_session.auth_queries {
                self.handle_auth_query(query)?;
            }
            return Ok(());
        }

        *self.inner.auth_state.write().unwrap() = AuthState::Full(api_session);
        self.on_full_auth().await
    }

    async fn set_unauthenticated(&self) {
        let previous = {
            let mut state = self.inner.auth_state.write().unwrap();
            let previous = state.api_session().cloned();
            *state = AuthState::Unauthenticated;
            previous
        };

        self.inner.pool.close_all().await;

        if let Some(previous) = previous {
            self.inner
                .events
                .auth_state_unauthenticated
                .emit(&previous);
        }
    }

    fn update_session_expiry(&self, expires_at: DateTime<Utc>) {
        let mut state = self.inner.auth_state.write().unwrap();
        if let AuthState::Partial(session) | AuthState::Full(session) = &mut *state {
            session.expires_at = expires_at;
        }
    }

    /// Completion of a full authentication. The one-time pieces (metrics
    /// scope, renewal loop, context-ready hook) run at most once per client;
    /// the full-auth event and service refresh run on every full auth.
    async fn on_full_auth(&self) -> Result<(), OverlayError> {
        self.inner.first_auth.call_once(|| {
            if let Some(session) = self.api_session() {
                self.inner.metrics.scope_to_identity(&session.identity.name);
            }

            let client = self.clone();
            tokio::spawn(async move { client.run_session_renewal().await });

            if let Some(hook) = &self.inner.options.on_context_ready {
                hook(self);
            }
        });

        if let Some(session) = self.api_session() {
            self.inner.events.auth_state_full.emit(&session);
        }

        self.sync_services(true).await
    }

    fn handle_auth_query(&self, query: &AuthQuery) -> Result<(), OverlayError> {
        self.inner.events.auth_query.emit(query);

        match &query.provider {
            MfaProvider::Totp => {
                let responder = MfaResponder::new(&self.inner);
                self.inner.events.mfa_totp_code.emit(&MfaPrompt {
                    query: query.clone(),
                    responder: responder.clone(),
                });

                let handler = self.inner.mfa_handler.read().unwrap().clone();
                match handler {
                    Some(handler) => handler(query, responder),
                    None => {
                        error!("no handler registered for totp auth queries, event was still emitted");
                        Ok(())
                    }
                }
            }
            MfaProvider::Unknown(provider) => {
                Err(OverlayError::UnsupportedMfaProvider(provider.clone()))
            }
        }
    }

    /// Register the handler invoked for TOTP auth queries during
    /// authentication.
    pub fn add_mfa_handler(
        &self,
        handler: impl Fn(&AuthQuery, MfaResponder) -> Result<(), OverlayError> + Send + Sync + 'static,
    ) {
        *self.inner.mfa_handler.write().unwrap() = Some(Arc::new(handler));
    }

    /// Answer an outstanding TOTP challenge; completes authentication when no
    /// queries remain.
    pub async fn authenticate_mfa(&self, code: &str) -> Result<(), OverlayError> {
        self.inner.control.authenticate_mfa(code).await?;

        let expires_at = self.inner.control.refresh().await?;
        self.update_session_expiry(expires_at);

        let completed = {
            let mut state = self.inner.auth_state.write().unwrap();
            match &mut *state {
                AuthState::Partial(session) => {
                    session
                        .auth_queries
                        .retain(|query| query.provider != MfaProvider::Totp);
                    if session.auth_queries.is_empty() {
                        let session = session.clone();
                        *state = AuthState::Full(session);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };

        if completed {
            self.on_full_auth().await
        } else {
            Ok(())
        }
    }

    /// Make sure an api session exists, authenticating when needed.
    pub(crate) async fn ensure_api_session(&self) -> Result<(), OverlayError> {
        if self.api_session().is_none() {
            self.authenticate().await?;
        }
        Ok(())
    }

    /// Authenticate under exponential backoff bounded by `timeout`.
    /// Authentication failures are never retried; transient control-plane
    /// errors are, until the budget runs out.
    pub(crate) async fn ensure_authenticated(&self, timeout: Duration) -> Result<(), OverlayError> {
        let mut backoff = Backoff::authenticate(timeout);
        loop {
            info!("attempting to establish new api session");
            match self.authenticate().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_authentication() => return Err(err),
                Err(err) => {
                    if !backoff.wait().await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Background renewal loop: refreshes the api session shortly before it
    /// expires and, on an independent cadence, checks for service-list
    /// updates.
    async fn run_session_renewal(&self) {
        let mut close_rx = self.close_signal();
        let mut svc_update = tokio::time::interval(self.inner.options.effective_refresh_interval());
        svc_update.tick().await; // consume the immediate first tick

        // absolute deadline, so service ticks never reset the renewal timer
        let mut renew_at = self.renewal_deadline();
        loop {
            tokio::select! {
                _ = close_rx.changed() => {
                    debug!("renewal loop exiting");
                    return;
                }
                _ = tokio::time::sleep_until(renew_at) => {
                    match self.inner.control.refresh().await {
                        Ok(expires_at) => {
                            self.inner.metrics.increment(counters::AUTH_REFRESH);
                            self.update_session_expiry(expires_at);
                            renew_at = self.renewal_deadline();
                            debug!(%expires_at, "api session refreshed");
                        }
                        Err(err) => {
                            error!("could not refresh api session: {err}");
                            renew_at = Instant::now() + REFRESH_RETRY_DELAY;
                        }
                    }
                }
                _ = svc_update.tick() => {
                    debug!("checking for service updates");
                    match self.sync_services(false).await {
                        Ok(()) => self.revalidate_sessions().await,
                        Err(err) => error!("failed to load service updates: {err}"),
                    }
                }
            }
        }
    }

    fn renewal_deadline(&self) -> Instant {
        let sleep_for = match self.api_session() {
            Some(session) => (session.expires_at - Utc::now())
                .to_std()
                .ok()
                .and_then(|until| until.checked_sub(SESSION_EXPIRY_LEAD))
                .unwrap_or(REFRESH_RETRY_DELAY),
            None => REFRESH_RETRY_DELAY,
        };
        Instant::now() + sleep_for
    }

    /// Re-validate cached dial sessions after a service-list change, discard
    /// the ones that no longer refresh, and reconnect to newly advertised
    /// routers in the background.
    pub(crate) async fn revalidate_sessions(&self) {
        let mut routers: HashMap<String, String> = HashMap::new(); // url -> router name
        let mut stale: Vec<Session> = Vec::new();

        for session in self.inner.sessions.all() {
            debug!(session = %session.id, "refreshing session");
            match self.refresh_session(&session.id).await {
                Ok(refreshed) => {
                    for router in &refreshed.routers {
                        for url in &router.urls {
                            if self.inner.options.url_accepted(url) {
                                routers.insert(url.clone(), router.name.clone());
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(session = %session.id, "failed to refresh session: {err}");
                    stale.push(session);
                }
            }
        }

        for session in stale {
            self.inner.sessions.remove(&session.service_id, session.kind);
        }

        if let Some(token) = self.api_session_token() {
            for (url, name) in routers {
                let pool = self.inner.pool.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    pool.connect_router(&name, &url, &token, None).await;
                });
            }
        }
    }
}
