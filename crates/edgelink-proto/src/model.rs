//! Control-plane model types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Direction of a service session: connect to a service, or host it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Dial,
    Bind,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Dial => write!(f, "dial"),
            SessionKind::Bind => write!(f, "bind"),
        }
    }
}

/// Identity summary attached to an api session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRef {
    pub id: String,
    pub name: String,
}

/// Provider of an outstanding auth query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaProvider {
    Totp,
    Unknown(String),
}

/// An outstanding authentication query on a partially-authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthQuery {
    pub provider: MfaProvider,
    pub type_id: String,
}

/// The control-plane session held by an authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub identity: IdentityRef,
    #[serde(default)]
    pub auth_queries: Vec<AuthQuery>,
}

/// Full identity detail returned by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub has_mfa_enrolled: bool,
}

/// A single compliance check the control plane requires for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostureQuery {
    pub id: String,
    pub kind: String,
}

/// Posture queries grouped by the policy that requires them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostureQuerySet {
    pub policy_id: String,
    #[serde(default)]
    pub posture_queries: Vec<PostureQuery>,
}

/// A named network resource the identity may dial or bind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub posture_queries: Vec<PostureQuerySet>,
    /// Raw configuration blobs keyed by config type name.
    #[serde(default)]
    pub configs: HashMap<String, serde_json::Value>,
}

/// Extract a typed config blob from a service by config type name.
///
/// Returns `Ok(None)` when the service carries no blob of that type; a
/// present but malformed blob is an error.
pub fn parse_service_config<T: serde::de::DeserializeOwned>(
    service: &Service,
    config_type: &str,
) -> Result<Option<T>, serde_json::Error> {
    match service.configs.get(config_type) {
        Some(raw) => serde_json::from_value(raw.clone()).map(Some),
        None => Ok(None),
    }
}

/// Router endpoints advertised on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRouter {
    pub name: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// A short-lived grant authorizing routing to specific routers for one
/// service and direction.
///
/// Refresh payloads omit the token; holders carry the token forward from the
/// created session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub service_id: String,
    pub kind: SessionKind,
    pub token: Option<String>,
    #[serde(default)]
    pub routers: Vec<SessionRouter>,
}

/// A terminator hosting a service behind a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terminator {
    pub id: String,
    pub service_id: String,
    pub router_id: String,
    pub address: String,
}

/// TOTP enrollment detail returned when enabling MFA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaEnrollment {
    pub provisioning_url: String,
    #[serde(default)]
    pub recovery_codes: Vec<String>,
}
