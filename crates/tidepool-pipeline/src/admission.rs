//! Admission control.
//!
//! Runs before anything is persisted or streamed. The gate answers two
//! questions: may this user generate at all, and does the run count
//! against their quota. Scheduled runs pass through the same gate as
//! interactive turns.

use async_trait::async_trait;
use tidepool_core::{AdmissionError, UserId};

/// Proof that admission passed, carried into the run.
#[derive(Debug, Clone, Copy)]
pub struct AccessGrant {
    /// Whether a clean finish of this run increments usage counters.
    pub billable: bool,
}

impl AccessGrant {
    pub fn billable() -> Self {
        Self { billable: true }
    }

    /// Courtesy access that never bills (internal users, trials).
    pub fn complimentary() -> Self {
        Self { billable: false }
    }
}

/// Decides whether a user may start a generation.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn check_access(&self, user: &UserId) -> Result<AccessGrant, AdmissionError>;
}

/// Admits everyone as billable. The default for single-tenant
/// deployments; hosted ones plug in a subscription-backed gate.
pub struct AllowAll;

#[async_trait]
impl AdmissionGate for AllowAll {
    async fn check_access(&self, _user: &UserId) -> Result<AccessGrant, AdmissionError> {
        Ok(AccessGrant::billable())
    }
}
