//! Client configuration

use crate::client::OverlayClient;
use crate::events::ServiceChange;
use edgelink_proto::Service;
use edgelink_transport::IdentitySigner;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Invoked exactly once, after the first full authentication.
pub type ContextReadyHook = Arc<dyn Fn(&OverlayClient) + Send + Sync>;

/// Invoked for every service added/changed/removed transition.
pub type ServiceUpdateHook = Arc<dyn Fn(ServiceChange, &Service) + Send + Sync>;

/// Decides whether a router ingress URL may be dialed.
pub type RouterUrlFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Client options.
#[derive(Clone, Default)]
pub struct Options {
    /// Cadence of the background service-list update check. Zero means the
    /// default of 30 seconds.
    pub refresh_interval: Duration,
    pub on_context_ready: Option<ContextReadyHook>,
    pub on_service_update: Option<ServiceUpdateHook>,
    /// Restricts which advertised router URLs are dialed; default accepts
    /// everything.
    pub router_url_filter: Option<RouterUrlFilter>,
    /// Signs the identity assertion for listeners that authenticate hosted
    /// connections as the local identity.
    pub identity_signer: Option<Arc<dyn IdentitySigner>>,
}

impl Options {
    pub(crate) fn url_accepted(&self, url: &str) -> bool {
        self.router_url_filter
            .as_ref()
            .map(|accept| accept(url))
            .unwrap_or(true)
    }

    pub(crate) fn effective_refresh_interval(&self) -> Duration {
        if self.refresh_interval.is_zero() {
            DEFAULT_REFRESH_INTERVAL
        } else {
            self.refresh_interval
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("refresh_interval", &self.refresh_interval)
            .field("on_context_ready", &self.on_context_ready.is_some())
            .field("on_service_update", &self.on_service_update.is_some())
            .field("router_url_filter", &self.router_url_filter.is_some())
            .field("identity_signer", &self.identity_signer.is_some())
            .finish()
    }
}
