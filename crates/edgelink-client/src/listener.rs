//! Listener manager
//!
//! One single-threaded control loop per hosted service keeps up to
//! `max_connections` hosting channels alive across distinct routers,
//! re-creates the bind session when it expires, and hands the currently
//! valid session to the data-plane multiplexer.
//!
//! The loop never performs blocking network calls itself: router dials and
//! listen establishment run in background tasks that report back through the
//! loop's channels, so all listener state stays single-writer.

use crate::client::OverlayClient;
use crate::pool::DialOutcome;
use edgelink_proto::{Service, Session, SessionKind};
use edgelink_transport::{ListenOptions, RouterConnection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MAKE_LISTENERS_INTERVAL: Duration = Duration::from_millis(250);
const SESSION_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const GET_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// When fully disconnected, how stale the session may get before an
/// out-of-cycle refresh.
const RAPID_REFRESH_AFTER: Duration = Duration::from_secs(1);

/// Bind-session state for a hosted service.
enum BindState {
    NoSession,
    Bound {
        session: Session,
        refreshed_at: Instant,
    },
}

impl BindState {
    fn session(&self) -> Option<&Session> {
        match self {
            BindState::Bound { session, .. } => Some(session),
            BindState::NoSession => None,
        }
    }

    fn refreshed_at(&self) -> Option<Instant> {
        match self {
            BindState::Bound { refreshed_at, .. } => Some(*refreshed_at),
            BindState::NoSession => None,
        }
    }
}

/// Whether any hosting channel is currently established.
#[derive(Clone, Copy)]
enum Redundancy {
    Disconnected { since: Instant },
    Connected,
}

/// Derived connectivity phase, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerPhase {
    NoSession,
    NoRouters,
    PartiallyConnected,
    FullyRedundant,
}

enum ListenerEvent {
    ListenFailed { router: String },
    ListenEstablished,
    GetSession { reply: oneshot::Sender<Option<Session>> },
    Close,
}

#[derive(Debug)]
struct ListenerShared {
    service: Service,
    closed: watch::Sender<bool>,
    close_reason: Mutex<Option<String>>,
    last_child_error: Mutex<Option<String>>,
}

impl ListenerShared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close_with_error(&self, reason: String) {
        let mut guard = self.close_reason.lock().unwrap();
        if guard.is_none() {
            *guard = Some(reason);
        }
        drop(guard);
        self.closed.send_replace(true);
    }
}

/// Public handle to a hosted (bind-side) service.
#[derive(Debug)]
pub struct HostedListener {
    shared: Arc<ListenerShared>,
    events_tx: mpsc::Sender<ListenerEvent>,
}

impl HostedListener {
    pub fn service_name(&self) -> &str {
        &self.shared.service.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the listener closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason.lock().unwrap().clone()
    }

    /// Most recent per-router establishment failure. Non-fatal while other
    /// routers stay connected.
    pub fn last_child_error(&self) -> Option<String> {
        self.shared.last_child_error.lock().unwrap().clone()
    }

    /// Wait until the listener closes.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close this listener.
    pub async fn close(&self) {
        let _ = self.events_tx.send(ListenerEvent::Close).await;
    }

    /// Current bind session, for data-plane demultiplexing. Answered by the
    /// control loop; `None` when the listener is closed or the query times
    /// out.
    pub async fn current_session(&self) -> Option<Session> {
        if self.is_closed() {
            return None;
        }

        let (reply, rx) = oneshot::channel();
        let send = self.events_tx.send(ListenerEvent::GetSession { reply });
        match tokio::time::timeout(GET_SESSION_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            _ => return None,
        }

        match tokio::time::timeout(GET_SESSION_TIMEOUT, rx).await {
            Ok(Ok(session)) => session,
            _ => None,
        }
    }
}

pub(crate) struct ListenerManager {
    client: OverlayClient,
    service: Service,
    options: ListenOptions,
    shared: Arc<ListenerShared>,
    state: BindState,
    redundancy: Redundancy,
    /// Router name → connection currently used for hosting.
    channels: HashMap<String, Arc<dyn RouterConnection>>,
    /// Ingress URL → dial start time, for in-flight dial dedup.
    pending_dials: HashMap<String, Instant>,
    dial_tx: mpsc::Sender<DialOutcome>,
    dial_rx: mpsc::Receiver<DialOutcome>,
    events_tx: mpsc::Sender<ListenerEvent>,
    events_rx: mpsc::Receiver<ListenerEvent>,
}

impl ListenerManager {
    pub(crate) fn spawn(
        client: OverlayClient,
        service: Service,
        options: ListenOptions,
    ) -> HostedListener {
        let (dial_tx, dial_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(ListenerShared {
            service: service.clone(),
            closed: closed_tx,
            close_reason: Mutex::new(None),
            last_child_error: Mutex::new(None),
        });

        let handle = HostedListener {
            shared: shared.clone(),
            events_tx: events_tx.clone(),
        };

        let manager = Self {
            client,
            service,
            options,
            shared,
            state: BindState::NoSession,
            redundancy: Redundancy::Disconnected {
                since: Instant::now(),
            },
            channels: HashMap::new(),
            pending_dials: HashMap::new(),
            dial_tx,
            dial_rx,
            events_tx,
            events_rx,
        };
        tokio::spawn(manager.run());

        handle
    }

    async fn run(mut self) {
        self.create_session_with_backoff().await;
        self.prepare_identity_assertion();
        self.make_more_listeners().await;

        let mut make_more = tokio::time::interval(MAKE_LISTENERS_INTERVAL);
        let mut refresh = tokio::time::interval(SESSION_REFRESH_INTERVAL);
        make_more.tick().await;
        refresh.tick().await;
        let mut close_rx = self.client.close_signal();

        while !self.shared.is_closed() {
            tokio::select! {
                Some(outcome) = self.dial_rx.recv() => self.handle_dial_outcome(outcome),
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = refresh.tick() => self.refresh_session().await,
                _ = make_more.tick() => self.make_more_listeners().await,
                _ = close_rx.changed() => {
                    self.close_with_error("context closed".to_string());
                }
            }
        }
        debug!(service = %self.service.name, "listener control loop exiting");
    }

    fn close_with_error(&mut self, reason: String) {
        warn!(service = %self.service.name, "closing listener: {reason}");
        self.shared.close_with_error(reason);
    }

    /// Sign the identity assertion once, when hosted connections authenticate
    /// as the local identity.
    fn prepare_identity_assertion(&mut self) {
        if self.options.bind_using_identity {
            if let Some(session) = self.client.api_session() {
                self.options.identity = Some(session.identity.name);
            }
        }

        if self.options.identity.is_none() {
            return;
        }

        match &self.client.inner.options.identity_signer {
            Some(signer) => match signer.assert_identity() {
                Ok(secret) => self.options.identity_secret = Some(secret),
                Err(err) => error!("failed to sign identity assertion: {err}"),
            },
            None => {
                warn!("listener configured to bind with an identity but no identity signer is set")
            }
        }
    }

    fn handle_dial_outcome(&mut self, outcome: DialOutcome) {
        self.pending_dials.remove(&outcome.url);
        let conn = match outcome.result {
            Ok(conn) => conn,
            Err(_) => return, // the dial worker already logged the failure
        };

        if self.channels.len() >= self.options.max_connections {
            debug!(
                router = %outcome.router_name,
                url = %outcome.url,
                "ignoring connection, already have max connections {}",
                self.options.max_connections
            );
            return;
        }
        if self.channels.contains_key(conn.router_name()) {
            return;
        }
        let session = match self.state.session() {
            Some(session) => session.clone(),
            None => return,
        };

        self.channels
            .insert(conn.router_name().to_string(), conn.clone());
        self.spawn_establish(conn, session);
    }

    /// Establish a hosting channel on one router connection; failures and
    /// later breakage both come back as `ListenFailed` events.
    fn spawn_establish(&self, conn: Arc<dyn RouterConnection>, session: Session) {
        let service = self.service.clone();
        let options = self.options.clone();
        let events_tx = self.events_tx.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            match conn.listen(&service, &session, &options).await {
                Ok(channel) => {
                    debug!(
                        router = %conn.router_name(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "listener established"
                    );
                    let _ = events_tx.send(ListenerEvent::ListenEstablished).await;

                    channel.wait_failed().await;
                    debug!(router = %conn.router_name(), "hosting channel reported broken");
                    let _ = events_tx
                        .send(ListenerEvent::ListenFailed {
                            router: conn.router_name().to_string(),
                        })
                        .await;
                }
                Err(err) => {
                    error!(
                        router = %conn.router_name(),
                        "creating listener failed after {}ms: {err}",
                        start.elapsed().as_millis()
                    );
                    *shared.last_child_error.lock().unwrap() = Some(err.to_string());
                    let _ = events_tx
                        .send(ListenerEvent::ListenFailed {
                            router: conn.router_name().to_string(),
                        })
                        .await;
                }
            }
        });
    }

    async fn handle_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::ListenFailed { router } => {
                self.channels.remove(&router);
                if self.channels.is_empty() {
                    self.redundancy = Redundancy::Disconnected {
                        since: Instant::now(),
                    };
                }
                debug!(
                    service = %self.service.name,
                    router = %router,
                    phase = ?self.phase(),
                    "hosting channel lost, recovering"
                );
                self.refresh_session().await;
                self.make_more_listeners().await;
            }
            ListenerEvent::ListenEstablished => {
                self.redundancy = Redundancy::Connected;
            }
            ListenerEvent::GetSession { reply } => {
                let _ = reply.send(self.state.session().cloned());
            }
            ListenerEvent::Close => {
                self.close_with_error("listener closed".to_string());
            }
        }
    }

    async fn make_more_listeners(&mut self) {
        if self.shared.is_closed() {
            return;
        }

        // fully disconnected: close once the connect timeout passes, refresh
        // the session more often until then
        let no_routers = self
            .state
            .session()
            .map(|session| session.routers.is_empty())
            .unwrap_or(true);
        if no_routers && self.channels.is_empty() {
            if let Redundancy::Disconnected { since } = self.redundancy {
                if since.elapsed() > self.options.connect_timeout {
                    self.close_with_error(
                        "disconnected for longer than connect timeout".to_string(),
                    );
                    return;
                }
            }

            let refresh_stale = self
                .state
                .refreshed_at()
                .map(|at| at.elapsed() > RAPID_REFRESH_AFTER)
                .unwrap_or(true);
            if refresh_stale {
                warn!(
                    service = %self.service.name,
                    "no routers available, refreshing session early"
                );
                self.refresh_session().await;
            }
        }

        if self.shared.is_closed() || self.channels.len() >= self.options.max_connections {
            return;
        }
        let session = match self.state.session() {
            Some(session) => session.clone(),
            None => return,
        };
        if session.routers.len() <= self.channels.len() {
            return;
        }
        let token = match self.client.api_session_token() {
            Some(token) => token,
            None => return,
        };

        for router in &session.routers {
            if self.channels.len() + self.pending_dials.len() >= self.options.max_connections {
                break;
            }
            if self.channels.contains_key(&router.name) {
                continue;
            }

            for url in &router.urls {
                if !self.client.inner.options.url_accepted(url) {
                    continue;
                }
                if self.pending_dials.contains_key(url) {
                    continue;
                }

                self.pending_dials.insert(url.clone(), Instant::now());
                let pool = self.client.inner.pool.clone();
                let name = router.name.clone();
                let url = url.clone();
                let token = token.clone();
                let dial_tx = self.dial_tx.clone();
                tokio::spawn(async move {
                    pool.connect_router(&name, &url, &token, Some(dial_tx)).await;
                });
            }
        }
    }

    /// Refresh the bind session, re-creating or re-authenticating as the
    /// error kinds demand. A successful refresh carries the original token
    /// forward, since refresh payloads omit it.
    async fn refresh_session(&mut self) {
        let current = match self.state.session() {
            Some(session) => session.clone(),
            None => {
                self.create_session_with_backoff().await;
                return;
            }
        };

        match self.client.refresh_session(&current.id).await {
            Ok(refreshed) => self.store_refreshed(refreshed, &current),
            Err(err) if err.is_not_found() => {
                self.create_session_with_backoff().await;
            }
            Err(err) if err.is_unauthorized() => {
                debug!(
                    service = %self.service.name,
                    "failure refreshing bind session ({err})"
                );
                if let Err(auth_err) = self
                    .client
                    .ensure_authenticated(self.options.connect_timeout)
                    .await
                {
                    // keep serving on surviving channels and retry later
                    if self.channels.is_empty() {
                        self.close_with_error(format!(
                            "unable to establish api session ({auth_err})"
                        ));
                    }
                    return;
                }

                match self.client.refresh_session(&current.id).await {
                    Ok(refreshed) => self.store_refreshed(refreshed, &current),
                    Err(err) if err.is_unauthorized() => {
                        error!(
                            service = %self.service.name,
                            "bind session unauthorized even after re-authenticating ({err})"
                        );
                        if self.channels.is_empty() {
                            self.close_with_error(format!("bind session unauthorized ({err})"));
                        }
                    }
                    Err(err) => {
                        error!(session = %current.id, "failed to refresh session ({err})");
                        self.create_session_with_backoff().await;
                    }
                }
            }
            Err(err) => {
                error!(session = %current.id, "failed to refresh session ({err})");
                self.create_session_with_backoff().await;
            }
        }
    }

    fn store_refreshed(&mut self, mut refreshed: Session, current: &Session) {
        refreshed.token = current.token.clone();
        self.state = BindState::Bound {
            session: refreshed,
            refreshed_at: Instant::now(),
        };
    }

    async fn create_session_with_backoff(&mut self) {
        match self
            .client
            .create_session_with_backoff(
                &self.service,
                SessionKind::Bind,
                self.options.connect_timeout,
            )
            .await
        {
            Ok(session) => {
                info!(
                    service = %self.service.name,
                    session = %session.id,
                    "new bind session"
                );
                self.state = BindState::Bound {
                    session,
                    refreshed_at: Instant::now(),
                };
            }
            Err(err) => {
                error!(
                    service = %self.service.name,
                    "failed to create bind session: {err}"
                );
            }
        }
    }

    fn phase(&self) -> ListenerPhase {
        match (&self.state, self.channels.len()) {
            (BindState::NoSession, _) => ListenerPhase::NoSession,
            (BindState::Bound { .. }, 0) => ListenerPhase::NoRouters,
            (BindState::Bound { .. }, n) if n < self.options.max_connections => {
                ListenerPhase::PartiallyConnected
            }
            _ => ListenerPhase::FullyRedundant,
        }
    }
}
