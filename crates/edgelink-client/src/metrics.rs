//! Client metrics
//!
//! A lightweight store scoped to the authenticated identity: named counters
//! for lifecycle operations plus a dial-latency histogram.

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub(crate) mod counters {
    pub const AUTH_REFRESH: &str = "auth.refresh";
    pub const SESSION_CREATE: &str = "session.create";
    pub const ROUTER_DIAL: &str = "router.dial";
    pub const DIAL_FAILURE: &str = "dial.failure";
}

#[derive(Clone)]
pub struct MetricsStore {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    identity: RwLock<Option<String>>,
    counters: DashMap<&'static str, AtomicU64>,
    dial_latency: Mutex<Histogram<u64>>,
}

impl MetricsStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                identity: RwLock::new(None),
                counters: DashMap::new(),
                dial_latency: Mutex::new(
                    Histogram::new(3).expect("three significant figures is a valid config"),
                ),
            }),
        }
    }

    pub(crate) fn scope_to_identity(&self, name: &str) {
        *self.inner.identity.write().unwrap() = Some(name.to_string());
    }

    pub(crate) fn increment(&self, name: &'static str) {
        self.inner
            .counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_latency(&self, latency: Duration) {
        let mut hist = self.inner.dial_latency.lock().unwrap();
        let _ = hist.record(latency.as_micros() as u64);
    }

    /// Point-in-time snapshot of all recorded metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hist = self.inner.dial_latency.lock().unwrap();
        MetricsSnapshot {
            identity: self.inner.identity.read().unwrap().clone(),
            counters: self
                .inner
                .counters
                .iter()
                .map(|entry| ((*entry.key()).to_string(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            dial_count: hist.len(),
            dial_latency_mean_us: hist.mean(),
            dial_latency_p99_us: hist.value_at_quantile(0.99) as f64,
        }
    }
}

/// Serializable view of the metrics store.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub identity: Option<String>,
    pub counters: HashMap<String, u64>,
    pub dial_count: u64,
    pub dial_latency_mean_us: f64,
    pub dial_latency_p99_us: f64,
}
