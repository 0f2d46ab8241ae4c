//! Overlay client facade
//!
//! [`OverlayClient`] composes the authentication state machine, the service
//! catalog, the session cache, the router connection pool, and the listener
//! manager into the public dial/listen surface.

use crate::api::{ControlClient, ControlError, MAX_TERMINATOR_PAGE};
use crate::auth::{AuthState, MfaHandler};
use crate::catalog::ServiceCatalog;
use crate::config::Options;
use crate::events::EventBus;
use crate::listener::{HostedListener, ListenerManager};
use crate::metrics::{counters, MetricsStore};
use crate::pool::RouterPool;
use crate::posture::PostureCache;
use crate::sessions::SessionCache;
use chrono::{DateTime, Utc};
use edgelink_proto::{IdentityDetail, MfaEnrollment, Service, Session, SessionKind, Terminator};
use edgelink_transport::{
    DataConn, DialOptions, ListenOptions, RouterDialer, TransportError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Timeout applied to dials that did not specify one.
pub(crate) const DEFAULT_EDGE_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("unsupported mfa provider: {0}")]
    UnsupportedMfaProvider(String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("no service intercepts address [{0}]")]
    NoServiceForAddress(String),

    #[error("no routers available: {0}")]
    NoRoutersAvailable(String),

    #[error("no routers connected in time")]
    NoRoutersInTime,

    #[error("invalid address '{0}': {1}")]
    InvalidAddress(String, String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("client closed")]
    Closed,
}

impl OverlayError {
    /// True for errors that mean the identity cannot authenticate; these are
    /// never retried.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            OverlayError::Authentication(_) | OverlayError::NotAuthenticated
        )
    }
}

/// SDK client for one identity. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct OverlayClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) id: String,
    pub(crate) options: Options,
    pub(crate) control: Arc<dyn ControlClient>,
    pub(crate) catalog: ServiceCatalog,
    pub(crate) sessions: SessionCache,
    pub(crate) pool: RouterPool,
    pub(crate) posture: PostureCache,
    pub(crate) events: EventBus,
    pub(crate) metrics: MetricsStore,
    pub(crate) auth_state: RwLock<AuthState>,
    pub(crate) mfa_handler: RwLock<Option<MfaHandler>>,
    pub(crate) first_auth: Once,
    pub(crate) last_service_update: RwLock<Option<DateTime<Utc>>>,
    pub(crate) closed: AtomicBool,
    pub(crate) close_tx: watch::Sender<bool>,
}

impl OverlayClient {
    /// Build a client over the given control-plane client and router dialer.
    pub fn new(
        control: Arc<dyn ControlClient>,
        dialer: Arc<dyn RouterDialer>,
        options: Options,
    ) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        let events = EventBus::new();
        let metrics = MetricsStore::new();
        let pool = RouterPool::new(dialer, events.clone(), metrics.clone(), close_rx);

        Self {
            inner: Arc::new(ClientInner {
                id: Uuid::new_v4().to_string(),
                options,
                control,
                catalog: ServiceCatalog::new(),
                sessions: SessionCache::new(),
                pool,
                posture: PostureCache::new(),
                events,
                metrics,
                auth_state: RwLock::new(AuthState::Unauthenticated),
                mfa_handler: RwLock::new(None),
                first_auth: Once::new(),
                last_service_update: RwLock::new(None),
                closed: AtomicBool::new(false),
                close_tx,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Unique client id, used by [`crate::ClientRegistry`].
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.inner.metrics
    }

    pub fn posture(&self) -> &PostureCache {
        &self.inner.posture
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_signal(&self) -> watch::Receiver<bool> {
        self.inner.close_tx.subscribe()
    }

    /// Close all router connections and stop every background worker.
    /// Idempotent.
    pub async fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.inner.close_tx.send(true);
            self.inner.pool.close_all().await;
        }
    }

    pub async fn get_current_identity(&self) -> Result<IdentityDetail, OverlayError> {
        self.ensure_api_session().await?;
        Ok(self.inner.control.get_current_identity().await?)
    }

    pub async fn get_service(&self, name: &str) -> Result<Option<Service>, OverlayError> {
        self.ensure_api_session().await?;
        Ok(self.inner.catalog.get(name))
    }

    pub async fn get_services(&self) -> Result<Vec<Service>, OverlayError> {
        self.ensure_api_session().await?;
        Ok(self.inner.catalog.all())
    }

    pub async fn get_service_id(&self, name: &str) -> Result<Option<String>, OverlayError> {
        Ok(self.get_service(name).await?.map(|svc| svc.id))
    }

    /// Force a service-list refresh from the control plane.
    pub async fn refresh_services(&self) -> Result<(), OverlayError> {
        self.sync_services(true).await
    }

    /// When the control plane last reported a service-list change.
    pub fn last_service_update(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_service_update.read().unwrap()
    }

    pub async fn get_service_terminators(
        &self,
        service_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Terminator>, usize), OverlayError> {
        let service = self
            .get_service(service_name)
            .await?
            .ok_or_else(|| OverlayError::ServiceNotFound(service_name.to_string()))?;
        let limit = limit.min(MAX_TERMINATOR_PAGE);
        Ok(self
            .inner
            .control
            .get_service_terminators(&service.id, offset, limit)
            .await?)
    }

    pub async fn enroll_mfa(&self) -> Result<MfaEnrollment, OverlayError> {
        Ok(self.inner.control.enroll_mfa().await?)
    }

    pub async fn verify_mfa(&self, code: &str) -> Result<(), OverlayError> {
        Ok(self.inner.control.verify_mfa(code).await?)
    }

    pub async fn remove_mfa(&self, code: &str) -> Result<(), OverlayError> {
        Ok(self.inner.control.remove_mfa(code).await?)
    }

    /// Connect to a service by name.
    pub async fn dial(&self, service_name: &str) -> Result<Box<dyn DataConn>, OverlayError> {
        self.dial_with_options(service_name, DialOptions::default())
            .await
    }

    pub async fn dial_with_options(
        &self,
        service_name: &str,
        mut options: DialOptions,
    ) -> Result<Box<dyn DataConn>, OverlayError> {
        if options.connect_timeout.is_zero() {
            options.connect_timeout = DEFAULT_EDGE_CONNECT_TIMEOUT;
        }

        self.ensure_api_session().await?;

        let service = self
            .inner
            .catalog
            .get(service_name)
            .ok_or_else(|| OverlayError::ServiceNotFound(service_name.to_string()))?;

        self.inner.posture.add_active_service(&service.id);
        if options.caller_id.is_none() {
            options.caller_id = self.api_session().map(|s| s.identity.name);
        }

        let session = match self
            .get_or_create_session(&service.id, SessionKind::Dial)
            .await
        {
            Ok(session) => session,
            Err(_) => {
                self.inner.sessions.invalidate_service(&service.id);
                self.create_session_with_backoff(&service, SessionKind::Dial, options.connect_timeout)
                    .await
                    .map_err(|err| {
                        OverlayError::Dial(format!(
                            "unable to dial service '{service_name}': {err}"
                        ))
                    })?
            }
        };

        debug!(session = %session.id, "connecting with session");
        let start = Instant::now();
        let first_err = match self.dial_session(&service, &session, &options).await {
            Ok(conn) => {
                self.inner.metrics.record_dial_latency(start.elapsed());
                return Ok(conn);
            }
            Err(err) => err,
        };
        self.inner.metrics.increment(counters::DIAL_FAILURE);

        // if the session still refreshes, it was not the problem; report the
        // original failure rather than churning a new session
        if self.refresh_session(&session.id).await.is_ok() {
            return Err(OverlayError::Dial(format!(
                "unable to dial service '{service_name}': {first_err}"
            )));
        }

        self.inner.sessions.invalidate_service(&service.id);
        let session = self
            .create_session_with_backoff(&service, SessionKind::Dial, options.connect_timeout)
            .await
            .map_err(|err| {
                OverlayError::Dial(format!("unable to dial service '{service_name}': {err}"))
            })?;

        match self.dial_session(&service, &session, &options).await {
            Ok(conn) => {
                self.inner.metrics.record_dial_latency(start.elapsed());
                Ok(conn)
            }
            Err(err) => {
                self.inner.metrics.increment(counters::DIAL_FAILURE);
                Err(OverlayError::Dial(format!(
                    "unable to dial service '{service_name}': {err}"
                )))
            }
        }
    }

    async fn dial_session(
        &self,
        service: &Service,
        session: &Session,
        options: &DialOptions,
    ) -> Result<Box<dyn DataConn>, OverlayError> {
        let conn = self
            .acquire_router_conn(session, options.connect_timeout)
            .await?;
        Ok(conn.connect(service, session, options).await?)
    }

    /// Resolve `protocol://addr` to a service via intercept rules and dial it.
    pub async fn dial_addr(
        &self,
        protocol: &str,
        addr: &str,
    ) -> Result<Box<dyn DataConn>, OverlayError> {
        let (host, port) = split_host_port(addr)?;

        self.ensure_api_session().await?;
        let (service, _score) = self.get_service_for_addr(protocol, &host, port)?;

        let normalized = edgelink_proto::InterceptProtocol::parse(protocol)
            .map(|p| p.to_string())
            .unwrap_or_else(|| protocol.to_string());

        let mut app_data = serde_json::json!({
            "dst_protocol": normalized,
            "dst_port": port.to_string(),
        });
        if host.parse::<std::net::IpAddr>().is_ok() {
            app_data["dst_ip"] = serde_json::Value::String(host.clone());
        } else {
            app_data["dst_hostname"] = serde_json::Value::String(host.clone());
        }

        let options = DialOptions {
            app_data: Some(app_data.to_string().into_bytes()),
            ..DialOptions::default()
        };
        self.dial_with_options(&service.name, options).await
    }

    /// Host a service by name.
    pub async fn listen(&self, service_name: &str) -> Result<HostedListener, OverlayError> {
        self.listen_with_options(service_name, ListenOptions::default())
            .await
    }

    pub async fn listen_with_options(
        &self,
        service_name: &str,
        mut options: ListenOptions,
    ) -> Result<HostedListener, OverlayError> {
        self.ensure_api_session().await?;

        let service = self
            .inner
            .catalog
            .get(service_name)
            .ok_or_else(|| OverlayError::ServiceNotFound(service_name.to_string()))?;

        if options.connect_timeout.is_zero() {
            options.connect_timeout = Duration::from_secs(60);
        }
        if options.max_connections < 1 {
            options.max_connections = 1;
        }

        Ok(ListenerManager::spawn(self.clone(), service, options))
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), OverlayError> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        OverlayError::InvalidAddress(addr.to_string(), "expected host:port".to_string())
    })?;
    let port = port.parse::<u16>().map_err(|e| {
        OverlayError::InvalidAddress(addr.to_string(), format!("bad port: {e}"))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(OverlayError::InvalidAddress(
            addr.to_string(),
            "empty host".to_string(),
        ));
    }
    Ok((host.to_string(), port))
}
