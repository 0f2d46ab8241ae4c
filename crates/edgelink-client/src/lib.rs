//! Overlay Network SDK Core
//!
//! `edgelink-client` owns the session and connectivity logic of the SDK: the
//! authentication lifecycle against the control plane, the service catalog
//! with address-based resolution, the latency-aware router connection pool,
//! and the listener manager that keeps hosted services reachable across
//! redundant routers.
//!
//! The wire protocol, TLS material, and the control-plane REST client are
//! collaborators behind traits ([`ControlClient`],
//! [`edgelink_transport::RouterDialer`]); this crate holds the state machines
//! that sit above them.

pub mod api;
pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod events;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod posture;
pub mod registry;
pub mod sessions;

mod backoff;

pub use api::{ControlClient, ControlError, MAX_TERMINATOR_PAGE};
pub use auth::{AuthState, MfaHandler, MfaResponder};
pub use client::{OverlayClient, OverlayError};
pub use config::Options;
pub use events::{EventBus, MfaPrompt, RouterEvent, ServiceChange, Subscription, Topic};
pub use listener::HostedListener;
pub use metrics::{MetricsSnapshot, MetricsStore};
pub use posture::PostureCache;
pub use registry::ClientRegistry;

pub use edgelink_proto as proto;
pub use edgelink_transport as transport;
