//! Router connection pool
//!
//! At most one live connection per ingress URL, enforced by an atomic upsert
//! under concurrent dials. Selection prefers the lowest mean measured
//! latency; a periodic probe keeps the measurement fresh and reaps channels
//! that stopped reading.

use crate::client::{OverlayClient, OverlayError};
use crate::events::{EventBus, RouterEvent};
use crate::metrics::{counters, MetricsStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edgelink_transport::{RouterConnection, RouterDialer, TransportAddress, TransportError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub(crate) const LATENCY_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const LATENCY_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Mean-latency tracker owned by a pool entry.
#[derive(Debug, Default)]
pub(crate) struct LatencyTracker {
    samples: Mutex<LatencySamples>,
}

#[derive(Debug, Default)]
struct LatencySamples {
    count: u32,
    total: Duration,
}

impl LatencyTracker {
    pub fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock().unwrap();
        samples.count += 1;
        samples.total += sample;
    }

    /// Mean measured latency; `None` before the first sample.
    pub fn mean(&self) -> Option<Duration> {
        let samples = self.samples.lock().unwrap();
        (samples.count > 0).then(|| samples.total / samples.count)
    }
}

struct PoolEntry {
    conn: Arc<dyn RouterConnection>,
    latency: Arc<LatencyTracker>,
}

/// Result of one background router dial.
pub(crate) struct DialOutcome {
    pub url: String,
    pub router_name: String,
    pub result: Result<Arc<dyn RouterConnection>, TransportError>,
}

#[derive(Clone)]
pub(crate) struct RouterPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connections: DashMap<String, PoolEntry>,
    dialer: Arc<dyn RouterDialer>,
    events: EventBus,
    metrics: MetricsStore,
    close_rx: watch::Receiver<bool>,
}

impl RouterPool {
    pub fn new(
        dialer: Arc<dyn RouterDialer>,
        events: EventBus,
        metrics: MetricsStore,
        close_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connections: DashMap::new(),
                dialer,
                events,
                metrics,
                close_rx,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    /// Whether an open connection is pooled for this URL.
    pub fn contains_open(&self, url: &str) -> bool {
        self.inner
            .connections
            .get(url)
            .map(|entry| !entry.conn.is_closed())
            .unwrap_or(false)
    }

    /// Best already-pooled connection among `urls`, by mean latency.
    pub fn best_connected(&self, urls: &[String]) -> Option<(Arc<dyn RouterConnection>, Duration)> {
        let mut best: Option<(Arc<dyn RouterConnection>, Duration)> = None;
        for url in urls {
            let Some(entry) = self.inner.connections.get(url) else {
                continue;
            };
            if entry.conn.is_closed() {
                continue;
            }
            let Some(mean) = entry.latency.mean() else {
                continue;
            };
            if best.as_ref().map(|(_, b)| mean < *b).unwrap_or(true) {
                best = Some((entry.conn.clone(), mean));
            }
        }
        best
    }

    /// Background dial worker. Replies are best-effort; a dropped or full
    /// reply queue never blocks the worker.
    pub async fn connect_router(
        &self,
        router_name: &str,
        url: &str,
        api_session_token: &str,
        reply: Option<mpsc::Sender<DialOutcome>>,
    ) {
        let result = self.dial_router(router_name, url, api_session_token).await;
        if let Err(err) = &result {
            warn!(router = %router_name, %url, "router dial failed: {err}");
        }
        if let Some(reply) = reply {
            let _ = reply.try_send(DialOutcome {
                url: url.to_string(),
                router_name: router_name.to_string(),
                result,
            });
        }
    }

    async fn dial_router(
        &self,
        router_name: &str,
        url: &str,
        api_session_token: &str,
    ) -> Result<Arc<dyn RouterConnection>, TransportError> {
        let existing = self
            .inner
            .connections
            .get(url)
            .map(|entry| entry.conn.clone());
        if let Some(conn) = existing {
            if !conn.is_closed() {
                return Ok(conn);
            }
            self.inner.connections.remove(url);
        }

        let addr = TransportAddress::parse(url)?;
        let start = Instant::now();
        let conn = self
            .inner
            .dialer
            .dial(router_name, &addr, api_session_token)
            .await?;
        let connect_time = start.elapsed();
        self.inner.metrics.increment(counters::ROUTER_DIAL);
        debug!(
            router = %router_name,
            %url,
            connect_ms = connect_time.as_millis() as u64,
            "connected to router"
        );

        // single-connection-per-URL invariant: the first insert wins and the
        // race loser is closed
        let (winner, fresh_tracker) = match self.inner.connections.entry(url.to_string()) {
            Entry::Occupied(occupied) => (occupied.get().conn.clone(), None),
            Entry::Vacant(vacant) => {
                let tracker = Arc::new(LatencyTracker::default());
                tracker.record(connect_time);
                vacant.insert(PoolEntry {
                    conn: conn.clone(),
                    latency: tracker.clone(),
                });
                (conn.clone(), Some(tracker))
            }
        };

        match fresh_tracker {
            Some(tracker) => {
                self.inner.events.router_connected.emit(&RouterEvent {
                    name: router_name.to_string(),
                    url: url.to_string(),
                });
                self.spawn_latency_probe(winner.clone(), tracker);
                self.spawn_close_watcher(winner.clone());
            }
            None => {
                if !Arc::ptr_eq(&winner, &conn) {
                    debug!(%url, "lost dial race, closing duplicate connection");
                    if let Err(err) = conn.close().await {
                        warn!(%url, "failed to close duplicate router connection: {err}");
                    }
                }
            }
        }

        Ok(winner)
    }

    fn spawn_latency_probe(&self, conn: Arc<dyn RouterConnection>, tracker: Arc<LatencyTracker>) {
        let mut close_rx = self.inner.close_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LATENCY_CHECK_INTERVAL);
            interval.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if conn.is_closed() {
                            return;
                        }
                        match conn.probe_latency(LATENCY_CHECK_TIMEOUT).await {
                            Ok(rtt) => tracker.record(rtt),
                            Err(err) => {
                                error!(router = %conn.router_name(), "latency probe failed: {err}");
                                if conn.time_since_last_read() > LATENCY_CHECK_INTERVAL {
                                    error!(
                                        router = %conn.router_name(),
                                        "no read activity since before the probe was sent, closing channel"
                                    );
                                    let _ = conn.close().await;
                                    return;
                                }
                            }
                        }
                    }
                    _ = close_rx.changed() => return,
                }
            }
        });
    }

    fn spawn_close_watcher(&self, conn: Arc<dyn RouterConnection>) {
        let pool = self.clone();
        tokio::spawn(async move {
            conn.wait_closed().await;
            pool.on_connection_closed(conn);
        });
    }

    fn on_connection_closed(&self, conn: Arc<dyn RouterConnection>) {
        debug!(router = %conn.router_name(), url = %conn.url(), "connection to router was closed");
        let removed = self
            .inner
            .connections
            .remove_if(conn.url(), |_, entry| Arc::ptr_eq(&entry.conn, &conn));
        if removed.is_some() {
            self.inner.events.router_disconnected.emit(&RouterEvent {
                name: conn.router_name().to_string(),
                url: conn.url().to_string(),
            });
        }
    }

    /// Close and evict every pooled connection.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<dyn RouterConnection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().conn.clone())
            .collect();
        self.inner.connections.clear();

        for conn in conns {
            if !conn.is_closed() {
                if let Err(err) = conn.close().await {
                    error!(router = %conn.router_name(), "error while closing router connection: {err}");
                }
            }
        }
    }
}

impl OverlayClient {
    /// Acquire a router connection for a session: refresh the router list,
    /// prefer the pooled connection with the best latency, and otherwise wait
    /// for one of the concurrently dialed candidates.
    pub(crate) async fn acquire_router_conn(
        &self,
        session: &edgelink_proto::Session,
        timeout: Duration,
    ) -> Result<Arc<dyn RouterConnection>, OverlayError> {
        let refreshed = match self.refresh_session(&session.id).await {
            Ok(refreshed) => refreshed,
            Err(err) => {
                if err.is_not_found() {
                    self.inner.sessions.remove(&session.service_id, session.kind);
                }
                return Err(OverlayError::NoRoutersAvailable(format!(
                    "session refresh failed: {err}"
                )));
            }
        };

        if refreshed.routers.is_empty() {
            return Err(OverlayError::NoRoutersAvailable(
                "session advertises no routers".to_string(),
            ));
        }

        let token = self
            .api_session_token()
            .ok_or(OverlayError::NotAuthenticated)?;

        let all_urls: Vec<String> = refreshed
            .routers
            .iter()
            .flat_map(|router| router.urls.clone())
            .collect();

        let (reply_tx, mut reply_rx) = mpsc::channel::<DialOutcome>(all_urls.len().max(1));
        for router in &refreshed.routers {
            for url in &router.urls {
                if self.inner.pool.contains_open(url) {
                    continue;
                }
                if !self.inner.options.url_accepted(url) {
                    continue;
                }
                let pool = self.inner.pool.clone();
                let name = router.name.clone();
                let url = url.clone();
                let token = token.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    pool.connect_router(&name, &url, &token, Some(reply_tx)).await;
                });
            }
        }
        drop(reply_tx);

        // fast path: a measured pooled connection wins without waiting on the
        // in-flight dials
        if let Some((conn, latency)) = self.inner.pool.best_connected(&all_urls) {
            debug!(
                router = %conn.router_name(),
                url = %conn.url(),
                latency_ms = latency.as_millis() as u64,
                "selected router with best latency"
            );
            return Ok(conn);
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                outcome = reply_rx.recv() => match outcome {
                    Some(DialOutcome { result: Ok(conn), url, .. }) => {
                        debug!(%url, "using freshly connected router");
                        return Ok(conn);
                    }
                    Some(DialOutcome { result: Err(_), .. }) => continue,
                    None => return Err(OverlayError::NoRoutersInTime),
                },
                _ = &mut deadline => return Err(OverlayError::NoRoutersInTime),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use edgelink_proto::{Service, Session};
    use edgelink_transport::{
        DataConn, DialOptions, HostedChannel, ListenOptions, TransportResult,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestConn {
        name: String,
        url: String,
        closed: AtomicBool,
        closed_tx: watch::Sender<bool>,
    }

    impl TestConn {
        fn new(name: &str, url: &str) -> Self {
            let (closed_tx, _) = watch::channel(false);
            Self {
                name: name.to_string(),
                url: url.to_string(),
                closed: AtomicBool::new(false),
                closed_tx,
            }
        }
    }

    #[async_trait]
    impl RouterConnection for TestConn {
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
            let _ = self.closed_tx.send(true);
            Ok(())
        }

        async fn wait_closed(&self) {
            let mut rx = self.closed_tx.subscribe();
            while !*rx.borrow() {
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

        fn underlay_certificate(&self) -> Option<edgelink_transport::Bytes> {
            None
        }

        async fn connect(
            &self,
            _service: &Service,
            _session: &Session,
            _options: &DialOptions,
        ) -> TransportResult<Box<dyn DataConn>> {
            Err(TransportError::Closed)
        }

        async fn listen(
            &self,
            _service: &Service,
            _session: &Session,
            _options: &ListenOptions,
        ) -> TransportResult<Box<dyn HostedChannel>> {
            Err(TransportError::Closed)
        }
    }

    #[derive(Default)]
    struct TestDialer {
        dials: AtomicUsize,
        created: Mutex<Vec<Arc<TestConn>>>,
    }

    #[async_trait]
    impl RouterDialer for TestDialer {
        async fn dial(
            &self,
            router_name: &str,
            addr: &TransportAddress,
            _api_session_token: &str,
        ) -> TransportResult<Arc<dyn RouterConnection>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            // yield so concurrent dials interleave before the upsert
            tokio::task::yield_now().await;
            let conn = Arc::new(TestConn::new(router_name, &addr.to_string()));
            self.created.lock().unwrap().push(conn.clone());
            Ok(conn)
        }
    }

    fn test_pool(dialer: Arc<TestDialer>) -> RouterPool {
        let (_close_tx, close_rx) = watch::channel(false);
        RouterPool::new(dialer, EventBus::new(), MetricsStore::new(), close_rx)
    }

    #[tokio::test]
    async fn test_concurrent_dials_keep_exactly_one_connection() {
        let dialer = Arc::new(TestDialer::default());
        let pool = test_pool(dialer.clone());

        let mut workers = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            workers.push(tokio::spawn(async move {
                pool.dial_router("router1", "tls:router1:3022", "token")
                    .await
                    .unwrap()
            }));
        }

        let mut conns = Vec::new();
        for worker in workers {
            conns.push(worker.await.unwrap());
        }

        assert_eq!(pool.len(), 1);
        let pooled = pool
            .inner
            .connections
            .get("tls:router1:3022")
            .map(|entry| entry.conn.clone())
            .unwrap();

        // every caller got the single pooled winner
        for conn in conns {
            assert!(Arc::ptr_eq(&conn, &pooled));
        }
        assert!(!pooled.is_closed());

        // every race loser was closed, never left open
        let created = dialer.created.lock().unwrap();
        let open = created.iter().filter(|c| !c.is_closed()).count();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn test_redial_after_close_replaces_entry() {
        let dialer = Arc::new(TestDialer::default());
        let pool = test_pool(dialer.clone());

        let first = pool
            .dial_router("router1", "tls:router1:3022", "token")
            .await
            .unwrap();
        first.close().await.unwrap();

        let second = pool
            .dial_router("router1", "tls:router1:3022", "token")
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_connection_is_reused_without_dialing() {
        let dialer = Arc::new(TestDialer::default());
        let pool = test_pool(dialer.clone());

        let first = pool
            .dial_router("router1", "tls:router1:3022", "token")
            .await
            .unwrap();
        let second = pool
            .dial_router("router1", "tls:router1:3022", "token")
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_best_connected_prefers_lowest_latency() {
        let dialer = Arc::new(TestDialer::default());
        let pool = test_pool(dialer);

        let slow = pool
            .dial_router("slow", "tls:slow:3022", "token")
            .await
            .unwrap();
        let fast = pool
            .dial_router("fast", "tls:fast:3022", "token")
            .await
            .unwrap();

        // overwrite the measured connect latencies with known values
        pool.inner
            .connections
            .get(slow.url())
            .unwrap()
            .latency
            .record(Duration::from_secs(2));
        pool.inner
            .connections
            .get(fast.url())
            .unwrap()
            .latency
            .record(Duration::from_micros(1));

        let urls = vec![slow.url().to_string(), fast.url().to_string()];
        let (best, _) = pool.best_connected(&urls).unwrap();
        assert_eq!(best.router_name(), "fast");
    }

    #[test]
    fn test_latency_tracker_mean() {
        let tracker = LatencyTracker::default();
        assert_eq!(tracker.mean(), None);
        tracker.record(Duration::from_millis(10));
        tracker.record(Duration::from_millis(20));
        assert_eq!(tracker.mean(), Some(Duration::from_millis(15)));
    }
}
