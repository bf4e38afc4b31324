//! Tests for error types

use std::error::Error as _;

use instance_harvest::core::{HarvestError, ProviderError};

#[test]
fn test_provider_error_display() {
    let err = ProviderError::LaunchRejected("InsufficientInstanceCapacity".into());
    assert_eq!(err.to_string(), "launch rejected: InsufficientInstanceCapacity");
    assert_eq!(
        ProviderError::Timeout("launch".into()).to_string(),
        "timed out: launch"
    );
}

#[test]
fn test_quota_discovery_keeps_source() {
    let err = HarvestError::QuotaDiscovery(ProviderError::Transport("dns".into()));
    assert_eq!(err.to_string(), "quota discovery failed: transport error: dns");
    assert!(err.source().is_some());
}

#[test]
fn test_provider_error_converts() {
    let err: HarvestError = ProviderError::NotFound("i-123".into()).into();
    assert!(matches!(err, HarvestError::Provider(ProviderError::NotFound(_))));
}

#[test]
fn test_unknown_admission_display() {
    assert_eq!(HarvestError::UnknownAdmission(7).to_string(), "unknown admission 7");
    assert_eq!(
        HarvestError::NoQuotaFamilies.to_string(),
        "no quota families discovered"
    );
}

#[test]
fn test_io_error_converts_to_store() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: HarvestError = io.into();
    assert!(err.to_string().starts_with("result store error"));
}
