//! Session cache
//!
//! At most one cached session per (service, direction) pair. Bind sessions
//! are never cached: each hosting session issues its own routing token, and
//! sharing one across listeners would overwrite routing state.

use crate::api::ControlError;
use crate::backoff::Backoff;
use crate::client::{OverlayClient, OverlayError};
use crate::metrics::counters;
use dashmap::DashMap;
use edgelink_proto::{Service, Session, SessionKind};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

fn session_key(service_id: &str, kind: SessionKind) -> String {
    format!("{service_id}:{kind}")
}

pub(crate) struct SessionCache {
    sessions: DashMap<String, Session>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, service_id: &str, kind: SessionKind) -> Option<Session> {
        self.sessions
            .get(&session_key(service_id, kind))
            .map(|entry| entry.value().clone())
    }

    /// Cache a freshly created session. Only dial sessions are cacheable.
    pub fn insert_created(&self, session: &Session) {
        if session.kind == SessionKind::Dial {
            self.sessions.insert(
                session_key(&session.service_id, session.kind),
                session.clone(),
            );
        }
    }

    /// Merge a refreshed session into the cache. Refresh payloads omit the
    /// token, so the cached token survives while the router list is replaced
    /// in place. Sessions that were never cached stay uncached.
    pub fn merge_refreshed(&self, session: &Session) {
        if session.kind != SessionKind::Dial {
            return;
        }
        let key = session_key(&session.service_id, session.kind);
        if let Some(mut entry) = self.sessions.get_mut(&key) {
            entry.routers = session.routers.clone();
        }
    }

    /// Drop both directions' entries for a service.
    pub fn invalidate_service(&self, service_id: &str) {
        self.sessions
            .remove(&session_key(service_id, SessionKind::Dial));
        self.sessions
            .remove(&session_key(service_id, SessionKind::Bind));
    }

    pub fn remove(&self, service_id: &str, kind: SessionKind) {
        self.sessions.remove(&session_key(service_id, kind));
    }

    pub fn all(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

impl OverlayClient {
    /// All currently cached dial sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.all()
    }

    /// Return the cached dial session for a service, creating one when the
    /// cache misses. Bind sessions always create.
    pub(crate) async fn get_or_create_session(
        &self,
        service_id: &str,
        kind: SessionKind,
    ) -> Result<Session, OverlayError> {
        if kind == SessionKind::Dial {
            if let Some(session) = self.inner.sessions.get(service_id, kind) {
                return Ok(session);
            }
        }

        self.inner.posture.add_active_service(service_id);
        let session = self.inner.control.create_session(service_id, kind).await?;
        self.inner.metrics.increment(counters::SESSION_CREATE);
        self.inner.sessions.insert_created(&session);
        Ok(session)
    }

    /// Create a session under exponential backoff bounded by `timeout`.
    ///
    /// An unauthorized create triggers a full re-authentication; when the
    /// re-authentication itself fails with an unrecoverable auth error the
    /// whole sequence ends immediately.
    pub(crate) async fn create_session_with_backoff(
        &self,
        service: &Service,
        kind: SessionKind,
        timeout: Duration,
    ) -> Result<Session, OverlayError> {
        let mut backoff = Backoff::session_create(timeout);
        loop {
            debug!(service = %service.name, %kind, "establishing session");
            let start = Instant::now();
            match self.get_or_create_session(&service.id, kind).await {
                Ok(session) => {
                    debug!(
                        service = %service.name,
                        %kind,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "session established"
                    );
                    return Ok(session);
                }
                Err(err) => {
                    warn!(service = %service.name, %kind, "session creation failed: {err}");

                    if let OverlayError::Control(control_err) = &err {
                        if control_err.is_unauthorized() {
                            match self.authenticate().await {
                                Ok(()) => {}
                                Err(auth_err) if auth_err.is_authentication() => {
                                    return Err(auth_err)
                                }
                                Err(_) => {}
                            }
                        }
                    }

                    if !backoff.wait().await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Re-fetch a session by id and fold the result into the dial cache.
    pub(crate) async fn refresh_session(&self, id: &str) -> Result<Session, ControlError> {
        let session = self.inner.control.get_session(id).await?;
        self.inner.sessions.merge_refreshed(&session);
        Ok(session)
    }
}
