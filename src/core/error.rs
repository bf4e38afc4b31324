//! Error types for harvest operations.

use thiserror::Error;

use crate::core::scheduler::AdmissionId;

/// Failures reported by external collaborators (provisioning, discovery,
/// result channel).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider refused to launch the requested instance.
    #[error("launch rejected: {0}")]
    LaunchRejected(String),
    /// An external wait exceeded its ceiling.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The referenced resource does not exist (any more).
    #[error("not found: {0}")]
    NotFound(String),
    /// Network or API transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors produced by scheduler, catalog and pool components.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Quota discovery returned no usable family. Fatal at startup.
    #[error("no quota families discovered")]
    NoQuotaFamilies,
    /// Quota discovery call failed. Fatal at startup.
    #[error("quota discovery failed: {0}")]
    QuotaDiscovery(#[source] ProviderError),
    /// A quota family produced a pattern that does not compile.
    #[error("invalid family pattern: {0}")]
    InvalidFamilyPattern(#[from] regex::Error),
    /// A family rule was built without any prefix token.
    #[error("family rule has no prefix tokens")]
    EmptyFamilyRule,
    /// The provider returned no cost information for an instance type.
    #[error("cost unavailable for instance type {0}")]
    CostUnavailable(String),
    /// A release named an admission this scheduler never granted or already released.
    #[error("unknown admission {0}")]
    UnknownAdmission(AdmissionId),
    /// Collaborator failure outside startup.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Result persistence failed.
    #[error("result store error: {0}")]
    Store(#[from] std::io::Error),
    /// Worker pool failure (thread spawn, channel closed).
    #[error("worker pool error: {0}")]
    Pool(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
