//! Router Transport Abstractions
//!
//! The SDK core never speaks the wire protocol itself. It drives an opaque
//! reliable-message channel to each edge router through the traits defined
//! here; concrete transports (TLS, QUIC, ...) implement them out of tree.

use async_trait::async_trait;
pub use bytes::Bytes;
use edgelink_proto::{Service, Session};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport address '{0}': {1}")]
    InvalidAddress(String, String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("channel closed")]
    Closed,

    #[error("listen rejected: {0}")]
    ListenRejected(String),

    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("identity assertion failed: {0}")]
    IdentityAssertion(String),
}

/// Parsed router ingress address.
///
/// Ingress URLs advertised by the control plane use the `scheme:host:port`
/// form, e.g. `tls:router1.edge.example.com:3022`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl TransportAddress {
    pub fn parse(url: &str) -> TransportResult<Self> {
        let mut parts = url.splitn(3, ':');
        let scheme = parts.next().unwrap_or_default();
        let host = parts.next().unwrap_or_default();
        let port = parts.next().unwrap_or_default();

        if scheme.is_empty() || host.is_empty() || port.is_empty() {
            return Err(TransportError::InvalidAddress(
                url.to_string(),
                "expected scheme:host:port".to_string(),
            ));
        }

        let port = port.parse::<u16>().map_err(|e| {
            TransportError::InvalidAddress(url.to_string(), format!("bad port: {e}"))
        })?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scheme, self.host, self.port)
    }
}

/// Options for dialing a service through a router connection.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    /// Terminator identity to dial when the service is hosted under distinct
    /// identities.
    pub identity: Option<String>,
    /// Name of the dialing identity, surfaced to the host.
    pub caller_id: Option<String>,
    /// Opaque application data delivered to the host on connect.
    pub app_data: Option<Vec<u8>>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            identity: None,
            caller_id: None,
            app_data: None,
        }
    }
}

/// Relative precedence of a hosting terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precedence {
    #[default]
    Default,
    Required,
    Failed,
}

/// Options for hosting a service through router connections.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// How long the listener may stay fully disconnected before it closes.
    pub connect_timeout: Duration,
    /// Maximum number of redundant hosting channels across distinct routers.
    pub max_connections: usize,
    pub cost: u16,
    pub precedence: Precedence,
    /// Host under this terminator identity.
    pub identity: Option<String>,
    /// Host under the identity the api session authenticated as.
    pub bind_using_identity: bool,
    /// Signed identity assertion; filled in once at listener startup.
    pub identity_secret: Option<String>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            max_connections: 3,
            cost: 0,
            precedence: Precedence::Default,
            identity: None,
            bind_using_identity: false,
            identity_secret: None,
        }
    }
}

/// Opaque end-to-end data connection produced by a dial. The data-plane
/// multiplexer owns everything beyond identification.
pub trait DataConn: Send + Sync + fmt::Debug {
    fn conn_id(&self) -> u64;
    fn service_name(&self) -> &str;
}

/// A single hosting (bind-side) channel established on one router.
#[async_trait]
pub trait HostedChannel: Send + Sync {
    fn router_name(&self) -> &str;

    /// Resolves when the underlying hosting channel is reported broken.
    async fn wait_failed(&self);

    async fn close(&self);
}

/// A live reliable-message channel to one edge router, shared by every
/// caller that routes through that router.
#[async_trait]
pub trait RouterConnection: Send + Sync {
    fn router_name(&self) -> &str;

    /// Ingress URL this connection was dialed on; identifies it in the pool.
    fn url(&self) -> &str;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> TransportResult<()>;

    /// Resolves when the underlying channel closes, however that happens.
    async fn wait_closed(&self);

    /// Time since the channel last saw read activity.
    fn time_since_last_read(&self) -> Duration;

    /// Round-trip a probe over the channel and report the latency.
    async fn probe_latency(&self, timeout: Duration) -> TransportResult<Duration>;

    /// Peer certificate presented by the router transport, when present.
    fn underlay_certificate(&self) -> Option<Bytes>;

    /// Open an end-to-end data connection for a dial session.
    async fn connect(
        &self,
        service: &Service,
        session: &Session,
        options: &DialOptions,
    ) -> TransportResult<Box<dyn DataConn>>;

    /// Establish a hosting channel for a bind session.
    async fn listen(
        &self,
        service: &Service,
        session: &Session,
        options: &ListenOptions,
    ) -> TransportResult<Box<dyn HostedChannel>>;
}

/// Dials new router connections, carrying the api session token as an
/// authentication header.
#[async_trait]
pub trait RouterDialer: Send + Sync {
    async fn dial(
        &self,
        router_name: &str,
        addr: &TransportAddress,
        api_session_token: &str,
    ) -> TransportResult<Arc<dyn RouterConnection>>;
}

/// Signs a one-time assertion used to authenticate hosted connections as the
/// local identity. Identity material loading stays outside the SDK core.
pub trait IdentitySigner: Send + Sync {
    fn assert_identity(&self) -> TransportResult<String>;
}
