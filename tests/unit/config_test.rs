//! Tests for configuration validation

use instance_harvest::config::HarvestConfig;
use instance_harvest::core::{DriverSettings, HarvestError, ResourceClass};
use std::time::Duration;

#[test]
fn test_default_config_matches_runner_constants() {
    let cfg = HarvestConfig::default();
    assert_eq!(cfg.worker_count, 47);
    assert_eq!(cfg.primary_class, ResourceClass::Spot);
    assert_eq!(cfg.fallback_class, Some(ResourceClass::OnDemand));
    assert_eq!(cfg.launch_timeout(), Duration::from_secs(60));
    assert_eq!(cfg.result_check_interval(), Duration::from_secs(30));
    assert_eq!(cfg.termination_timeout(), Duration::from_secs(300));
    assert_eq!(cfg.http_timeout(), Duration::from_secs(1800));
    assert_eq!(cfg.result_port, 8080);
    assert_eq!(cfg.quota_name_marker, "Spot Instance Requests");
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_zero_workers_rejected() {
    let cfg = HarvestConfig::new().with_worker_count(0);
    assert!(cfg.validate().unwrap_err().contains("worker_count"));
}

#[test]
fn test_zero_timeout_rejected() {
    let cfg = HarvestConfig::new().with_termination_timeout_ms(0);
    assert!(cfg.validate().unwrap_err().contains("termination_timeout_ms"));
}

#[test]
fn test_interval_longer_than_ceiling_rejected() {
    let cfg = HarvestConfig::new()
        .with_experiment_timeout_ms(1_000)
        .with_result_check_interval_ms(5_000);
    assert!(cfg.validate().is_err());

    let cfg = HarvestConfig::new()
        .with_start_timeout_ms(1_000)
        .with_state_poll_interval_ms(2_000);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_fallback_equal_to_primary_rejected() {
    let cfg = HarvestConfig::new().with_fallback_class(Some(ResourceClass::Spot));
    assert!(cfg.validate().unwrap_err().contains("fallback_class"));
    assert!(HarvestConfig::new().with_fallback_class(None).validate().is_ok());
}

#[test]
fn test_empty_marker_rejected() {
    let cfg = HarvestConfig::new().with_quota_name_marker("  ");
    assert!(cfg.validate().is_err());
}

#[test]
fn test_from_json_fills_defaults() {
    let cfg = HarvestConfig::from_json_str(
        r#"{ "worker_count": 8, "fallback_class": null, "result_dir": "out" }"#,
    )
    .unwrap();
    assert_eq!(cfg.worker_count, 8);
    assert_eq!(cfg.fallback_class, None);
    assert_eq!(cfg.result_dir, std::path::PathBuf::from("out"));
    assert_eq!(cfg.start_timeout_ms, 60_000);
}

#[test]
fn test_from_json_rejects_invalid() {
    assert!(matches!(
        HarvestConfig::from_json_str(r#"{ "worker_count": 0 }"#),
        Err(HarvestError::InvalidConfig(_))
    ));
    assert!(matches!(
        HarvestConfig::from_json_str("not json"),
        Err(HarvestError::InvalidConfig(_))
    ));
}

#[test]
fn test_driver_settings_follow_config() {
    let cfg = HarvestConfig::new()
        .with_primary_class(ResourceClass::OnDemand)
        .with_fallback_class(None)
        .with_start_timeout_ms(1_500);
    let settings = DriverSettings::from(&cfg);
    assert_eq!(settings.primary, ResourceClass::OnDemand);
    assert_eq!(settings.fallback, None);
    assert_eq!(settings.start_timeout, Duration::from_millis(1_500));
}
