//! Typed event topics
//!
//! Every notification the SDK raises has its own statically-typed topic, so
//! a subscriber can never receive a payload of the wrong shape. Subscriptions
//! are id-keyed; removing one never disturbs the rest.

use crate::auth::MfaResponder;
use edgelink_proto::{ApiSession, AuthQuery, Service};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One notification stream with a fixed payload type.
pub struct Topic<T> {
    inner: Arc<TopicInner<T>>,
}

struct TopicInner<T> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<HashMap<u64, Handler<T>>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Topic<T> {
    fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(TopicInner {
                name,
                next_id: AtomicU64::new(0),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a handler. The returned subscription detaches the handler
    /// when dropped or cancelled.
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(id, Arc::new(handler));

        let topic = self.clone();
        Subscription {
            detach: Some(Box::new(move || topic.unsubscribe(id))),
        }
    }

    pub fn emit(&self, payload: &T) {
        trace!(topic = self.inner.name, "emitting event");
        let handlers: Vec<Handler<T>> = self
            .inner
            .handlers
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(payload);
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.handlers.lock().unwrap().remove(&id);
    }
}

/// Handle for one registered handler; detaches it on drop.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Detach the handler now instead of at drop time.
    pub fn cancel(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Router identity carried on connect/disconnect notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterEvent {
    pub name: String,
    pub url: String,
}

/// A TOTP challenge awaiting a code.
#[derive(Clone)]
pub struct MfaPrompt {
    pub query: AuthQuery,
    pub responder: MfaResponder,
}

/// Which way a service moved in a snapshot diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceChange {
    Added,
    Changed,
    Removed,
}

/// All notification topics raised by the SDK.
#[derive(Clone)]
pub struct EventBus {
    pub service_added: Topic<Service>,
    pub service_changed: Topic<Service>,
    pub service_removed: Topic<Service>,
    pub router_connected: Topic<RouterEvent>,
    pub router_disconnected: Topic<RouterEvent>,
    pub auth_query: Topic<AuthQuery>,
    pub auth_state_partial: Topic<ApiSession>,
    pub auth_state_full: Topic<ApiSession>,
    pub auth_state_unauthenticated: Topic<ApiSession>,
    pub mfa_totp_code: Topic<MfaPrompt>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            service_added: Topic::new("service-added"),
            service_changed: Topic::new("service-changed"),
            service_removed: Topic::new("service-removed"),
            router_connected: Topic::new("router-connected"),
            router_disconnected: Topic::new("router-disconnected"),
            auth_query: Topic::new("auth-query"),
            auth_state_partial: Topic::new("auth-state-partial"),
            auth_state_full: Topic::new("auth-state-full"),
            auth_state_unauthenticated: Topic::new("auth-state-unauthenticated"),
            mfa_totp_code: Topic::new("mfa-totp-code"),
        }
    }
}
