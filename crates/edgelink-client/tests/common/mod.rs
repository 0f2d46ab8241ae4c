//! Shared test doubles: a scriptable control plane and router network.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use edgelink_client::{ControlClient, ControlError, Options, OverlayClient};
use edgelink_proto::{
    ApiSession, AuthQuery, IdentityDetail, IdentityRef, MfaEnrollment, Service, Session,
    SessionKind, SessionRouter, Terminator,
};
use edgelink_transport::{
    Bytes, DataConn, DialOptions, HostedChannel, ListenOptions, RouterConnection, RouterDialer,
    TransportAddress, TransportError, TransportResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// How the mock control plane answers `get_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLookup {
    Normal,
    NotFound,
    Unauthorized,
}

struct ControlState {
    services: Vec<Service>,
    routers: Vec<SessionRouter>,
    auth_queries: Vec<AuthQuery>,
    issued: HashMap<String, Session>,
    next_session: usize,
    fail_create: bool,
    create_unauthorized: bool,
    fail_refresh: bool,
    session_lookup: SessionLookup,
    services_changed: bool,
}

pub struct MockControl {
    state: Mutex<ControlState>,
    pub authenticate_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub get_session_calls: AtomicUsize,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlState {
                services: Vec::new(),
                routers: vec![SessionRouter {
                    name: "router1".to_string(),
                    urls: vec!["tls:router1:3022".to_string()],
                }],
                auth_queries: Vec::new(),
                issued: HashMap::new(),
                next_session: 0,
                fail_create: false,
                create_unauthorized: false,
                fail_refresh: false,
                session_lookup: SessionLookup::Normal,
                services_changed: false,
            }),
            authenticate_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            get_session_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_services(&self, services: Vec<Service>) {
        let mut state = self.state.lock().unwrap();
        state.services = services;
        state.services_changed = true;
    }

    pub fn set_routers(&self, routers: Vec<SessionRouter>) {
        self.state.lock().unwrap().routers = routers;
    }

    pub fn set_auth_queries(&self, queries: Vec<AuthQuery>) {
        self.state.lock().unwrap().auth_queries = queries;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn set_create_unauthorized(&self, fail: bool) {
        self.state.lock().unwrap().create_unauthorized = fail;
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.state.lock().unwrap().fail_refresh = fail;
    }

    pub fn set_session_lookup(&self, mode: SessionLookup) {
        self.state.lock().unwrap().session_lookup = mode;
    }

    /// Drop a session server-side, as expiry would; later lookups return
    /// not-found.
    pub fn forget_session(&self, id: &str) {
        self.state.lock().unwrap().issued.remove(id);
    }

    fn expiry() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::hours(1)
    }
}

#[async_trait]
impl ControlClient for MockControl {
    async fn authenticate(&self) -> Result<ApiSession, ControlError> {
        let calls = self.authenticate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let state = self.state.lock().unwrap();
        Ok(ApiSession {
            token: format!("api-token-{calls}"),
            expires_at: Self::expiry(),
            identity: IdentityRef {
                id: "identity-1".to_string(),
                name: "test-identity".to_string(),
            },
            auth_queries: state.auth_queries.clone(),
        })
    }

    async fn refresh(&self) -> Result<DateTime<Utc>, ControlError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().unwrap().fail_refresh {
            return Err(ControlError::Unauthorized("api session expired".to_string()));
        }
        Ok(Self::expiry())
    }

    async fn get_services(&self) -> Result<Vec<Service>, ControlError> {
        Ok(self.state.lock().unwrap().services.clone())
    }

    async fn is_service_list_update_available(
        &self,
    ) -> Result<(bool, Option<DateTime<Utc>>), ControlError> {
        let mut state = self.state.lock().unwrap();
        let changed = state.services_changed;
        state.services_changed = false;
        Ok((changed, Some(Utc::now())))
    }

    async fn create_session(
        &self,
        service_id: &str,
        kind: SessionKind,
    ) -> Result<Session, ControlError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(ControlError::Api("control plane unavailable".to_string()));
        }
        if state.create_unauthorized {
            return Err(ControlError::Unauthorized("no dial permission".to_string()));
        }

        state.next_session += 1;
        let session = Session {
            id: format!("session-{}", state.next_session),
            service_id: service_id.to_string(),
            kind,
            token: Some(format!("session-token-{}", state.next_session)),
            routers: state.routers.clone(),
        };
        state.issued.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Session, ControlError> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        match state.session_lookup {
            SessionLookup::NotFound => {
                return Err(ControlError::NotFound(format!("session {id}")))
            }
            SessionLookup::Unauthorized => {
                return Err(ControlError::Unauthorized(format!("session {id}")))
            }
            SessionLookup::Normal => {}
        }

        let issued = state
            .issued
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("session {id}")))?;
        // refresh payloads omit the token and carry the current router list
        Ok(Session {
            token: None,
            routers: state.routers.clone(),
            ..issued.clone()
        })
    }

    async fn get_service_terminators(
        &self,
        _service_id: &str,
        _offset: usize,
        _limit: usize,
    ) -> Result<(Vec<Terminator>, usize), ControlError> {
        Ok((Vec::new(), 0))
    }

    async fn authenticate_mfa(&self, _code: &str) -> Result<(), ControlError> {
        Ok(())
    }

    async fn enroll_mfa(&self) -> Result<MfaEnrollment, ControlError> {
        Ok(MfaEnrollment {
            provisioning_url: "otpauth://totp/test".to_string(),
            recovery_codes: vec!["aaaa-bbbb".to_string()],
        })
    }

    async fn verify_mfa(&self, _code: &str) -> Result<(), ControlError> {
        Ok(())
    }

    async fn remove_mfa(&self, _code: &str) -> Result<(), ControlError> {
        Ok(())
    }

    async fn get_current_identity(&self) -> Result<IdentityDetail, ControlError> {
        Ok(IdentityDetail {
            id: "identity-1".to_string(),
            name: "test-identity".to_string(),
            has_mfa_enrolled: false,
        })
    }
}

/// Scriptable router network shared by the dialer, connections, and hosting
/// channels.
pub struct MockNet {
    pub dialed: Mutex<Vec<Arc<MockRouterConn>>>,
    pub channels: Mutex<Vec<Arc<MockChannelState>>>,
    pub fail_dial: AtomicBool,
    pub fail_listen: AtomicBool,
    pub fail_connect_once: AtomicBool,
    pub listen_calls: AtomicUsize,
    pub active_listens: AtomicUsize,
    pub max_active_listens: AtomicUsize,
    next_conn_id: AtomicU64,
}

impl MockNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dialed: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            fail_dial: AtomicBool::new(false),
            fail_listen: AtomicBool::new(false),
            fail_connect_once: AtomicBool::new(false),
            listen_calls: AtomicUsize::new(0),
            active_listens: AtomicUsize::new(0),
            max_active_listens: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(0),
        })
    }

    /// Currently established hosting channels.
    pub fn active_channels(&self) -> Vec<Arc<MockChannelState>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|ch| !ch.is_failed())
            .cloned()
            .collect()
    }
}

pub struct MockChannelState {
    pub router: String,
    failed_tx: watch::Sender<bool>,
    net: Arc<MockNet>,
}

impl MockChannelState {
    pub fn is_failed(&self) -> bool {
        *self.failed_tx.borrow()
    }

    /// Report the hosting channel broken, as a router would on disconnect.
    pub fn fail(&self) {
        if !self.is_failed() {
            self.net.active_listens.fetch_sub(1, Ordering::SeqCst);
            self.failed_tx.send_replace(true);
        }
    }
}

struct MockHostedChannel {
    state: Arc<MockChannelState>,
}

#[async_trait]
impl HostedChannel for MockHostedChannel {
    fn router_name(&self) -> &str {
        &self.state.router
    }

    async fn wait_failed(&self) {
        let mut rx = self.state.failed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) {
        self.state.fail();
    }
}

#[derive(Debug)]
struct MockDataConn {
    id: u64,
    service: String,
}

impl DataConn for MockDataConn {
    fn conn_id(&self) -> u64 {
        self.id
    }

    fn service_name(&self) -> &str {
        &self.service
    }
}

pub struct MockRouterConn {
    name: String,
    url: String,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    net: Arc<MockNet>,
}

impl MockRouterConn {
    fn new(name: &str, url: &str, net: Arc<MockNet>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            url: url.to_string(),
            closed: AtomicBool::new(false),
            closed_tx,
            net,
        }
    }
}

#[async_trait]
impl RouterConnection for MockRouterConn {
    fn router_name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn time_since_last_read(&self) -> Duration {
        Duration::from_secs(0)
    }

    async fn probe_latency(&self, _timeout: Duration) -> TransportResult<Duration> {
        Ok(Duration::from_millis(1))
    }

    fn underlay_certificate(&self) -> Option<Bytes> {
        None
    }

    async fn connect(
        &self,
        service: &Service,
        _session: &Session,
        _options: &DialOptions,
    ) -> TransportResult<Box<dyn DataConn>> {
        if self.net.fail_connect_once.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(MockDataConn {
            id: self.net.next_conn_id.fetch_add(1, Ordering::SeqCst),
            service: service.name.clone(),
        }))
    }

    async fn listen(
        &self,
        _service: &Service,
        _session: &Session,
        _options: &ListenOptions,
    ) -> TransportResult<Box<dyn HostedChannel>> {
        self.net.listen_calls.fetch_add(1, Ordering::SeqCst);
        if self.net.fail_listen.load(Ordering::SeqCst) {
            return Err(TransportError::ListenRejected("router refused".to_string()));
        }

        let active = self.net.active_listens.fetch_add(1, Ordering::SeqCst) + 1;
        self.net.max_active_listens.fetch_max(active, Ordering::SeqCst);

        let (failed_tx, _) = watch::channel(false);
        let state = Arc::new(MockChannelState {
            router: self.name.clone(),
            failed_tx,
            net: self.net.clone(),
        });
        self.net.channels.lock().unwrap().push(state.clone());
        Ok(Box::new(MockHostedChannel { state }))
    }
}

pub struct MockDialer {
    net: Arc<MockNet>,
}

#[async_trait]
impl RouterDialer for MockDialer {
    async fn dial(
        &self,
        router_name: &str,
        addr: &TransportAddress,
        _api_session_token: &str,
    ) -> TransportResult<Arc<dyn RouterConnection>> {
        if self.net.fail_dial.load(Ordering::SeqCst) {
            return Err(TransportError::DialFailed(format!("{addr} unreachable")));
        }
        let conn = Arc::new(MockRouterConn::new(router_name, &addr.to_string(), self.net.clone()));
        self.net.dialed.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

pub fn test_client(control: Arc<MockControl>, net: Arc<MockNet>) -> OverlayClient {
    test_client_with_options(control, net, Options::default())
}

pub fn test_client_with_options(
    control: Arc<MockControl>,
    net: Arc<MockNet>,
    options: Options,
) -> OverlayClient {
    OverlayClient::new(control, Arc::new(MockDialer { net }), options)
}

pub fn service(id: &str, name: &str) -> Service {
    Service {
        id: id.to_string(),
        name: name.to_string(),
        posture_queries: Vec::new(),
        configs: HashMap::new(),
    }
}

pub fn service_with_intercept(id: &str, name: &str, host: &str, port: u16) -> Service {
    let mut svc = service(id, name);
    svc.configs.insert(
        edgelink_proto::INTERCEPT_CONFIG_V1.to_string(),
        serde_json::json!({
            "protocols": ["tcp"],
            "addresses": [host],
            "port_ranges": [{ "low": port, "high": port }],
        }),
    );
    svc
}

pub fn router(name: &str) -> SessionRouter {
    SessionRouter {
        name: name.to_string(),
        urls: vec![format!("tls:{name}:3022")],
    }
}

/// Poll until `cond` holds, advancing (paused) time in small steps.
pub async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// [`wait_for`] over an async condition.
pub async fn wait_for_async<F, Fut>(mut cond: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..2_000 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
