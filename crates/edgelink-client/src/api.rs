//! Control-plane client contract
//!
//! The REST client is a collaborator; the core depends only on this trait
//! and on the error kinds it distinguishes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edgelink_proto::{
    ApiSession, IdentityDetail, MfaEnrollment, Service, Session, SessionKind, Terminator,
};
use thiserror::Error;

/// Hard cap the control plane imposes on terminator page sizes.
pub const MAX_TERMINATOR_PAGE: usize = 500;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("control plane error: {0}")]
    Api(String),
}

impl ControlError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ControlError::Unauthorized(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::NotFound(_))
    }
}

/// Operations the SDK core needs from the control plane.
///
/// Implementations hold the credential material and the current api session
/// token internally; the core drives state transitions through these calls
/// and tracks the session view on its side.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Establish a fresh api session for the configured credentials.
    async fn authenticate(&self) -> Result<ApiSession, ControlError>;

    /// Extend the current api session; returns the new expiry.
    async fn refresh(&self) -> Result<DateTime<Utc>, ControlError>;

    async fn get_services(&self) -> Result<Vec<Service>, ControlError>;

    /// Cheap check whether the service list changed since the last fetch.
    async fn is_service_list_update_available(
        &self,
    ) -> Result<(bool, Option<DateTime<Utc>>), ControlError>;

    async fn create_session(
        &self,
        service_id: &str,
        kind: SessionKind,
    ) -> Result<Session, ControlError>;

    async fn get_session(&self, id: &str) -> Result<Session, ControlError>;

    async fn get_service_terminators(
        &self,
        service_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Terminator>, usize), ControlError>;

    /// Answer an outstanding TOTP auth query on the current api session.
    async fn authenticate_mfa(&self, code: &str) -> Result<(), ControlError>;

    async fn enroll_mfa(&self) -> Result<MfaEnrollment, ControlError>;

    /// Complete TOTP enrollment with a first code.
    async fn verify_mfa(&self, code: &str) -> Result<(), ControlError>;

    async fn remove_mfa(&self, code: &str) -> Result<(), ControlError>;

    async fn get_current_identity(&self) -> Result<IdentityDetail, ControlError>;
}
