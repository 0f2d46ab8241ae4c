//! Overlay Network Protocol Definitions
//!
//! This crate defines the model types shared between the control-plane
//! client, the router transport, and the SDK core: services, sessions,
//! routers, identities, and intercept (address-matching) configuration.

pub mod intercept;
pub mod model;

pub use intercept::{ClientConfig, InterceptConfig, InterceptProtocol, PortRange, MATCH_EXACT};
pub use model::*;

/// Config type name for host-based intercept configuration.
pub const INTERCEPT_CONFIG_V1: &str = "intercept.v1";

/// Config type name for the legacy single-address client configuration.
pub const CLIENT_CONFIG_V1: &str = "edgelink-client.v1";
