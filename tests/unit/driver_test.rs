//! Tests for the per-item driver

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use instance_harvest::core::{
    Driver, DriverSettings, ExecutionOutcome, HarvestError, InstanceState, LaunchKind,
    LaunchOutcome, ResourceClass, ResultSink, Teardown, WorkItem,
};
use instance_harvest::infra::{FsResultStore, SimulatedCloud, TypeBehavior};

const STANDARD_QUOTA: &str = "All Standard (A, C, D, H, I, M, R, T, Z) Spot Instance Requests";

fn settings() -> DriverSettings {
    DriverSettings {
        primary: ResourceClass::Spot,
        fallback: Some(ResourceClass::OnDemand),
        launch_timeout: Duration::from_millis(100),
        start_timeout: Duration::from_millis(100),
        state_poll_interval: Duration::from_millis(2),
        result_check_interval: Duration::from_millis(2),
        experiment_timeout: Duration::from_millis(100),
        termination_timeout: Duration::from_millis(50),
    }
}

struct ExplodingSink;

impl ResultSink for ExplodingSink {
    fn persist(&self, instance_type: &str, _payload: &[u8]) -> Result<PathBuf, HarvestError> {
        panic!("disk vanished while storing {instance_type}");
    }
}

fn driver(cloud: &Arc<SimulatedCloud>, dir: &tempfile::TempDir, settings: DriverSettings) -> Driver {
    Driver::new(
        cloud.clone(),
        cloud.clone(),
        Arc::new(FsResultStore::new(dir.path(), "probe")),
        settings,
    )
}

#[tokio::test]
async fn test_primary_launch_collects_payload() {
    let cloud = Arc::new(
        SimulatedCloud::new()
            .with_quota(STANDARD_QUOTA, 8.0)
            .with_behavior("c5.large", TypeBehavior::new().payload(b"tarball".to_vec())),
    );
    let dir = tempfile::tempdir().unwrap();
    let report = driver(&cloud, &dir, settings())
        .drive(&WorkItem::new("c5.large"))
        .await;

    assert_eq!(report.launch, LaunchKind::Primary);
    assert_eq!(report.teardown, Teardown::Confirmed);
    match report.execution {
        Some(ExecutionOutcome::Collected { path, bytes }) => {
            assert_eq!(bytes, 7);
            assert_eq!(std::fs::read(path).unwrap(), b"tarball");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_fallback_disabled_fails_launch() {
    let cloud = Arc::new(
        SimulatedCloud::new().with_behavior("m5.large", TypeBehavior::new().reject(ResourceClass::Spot)),
    );
    let dir = tempfile::tempdir().unwrap();
    let mut s = settings();
    s.fallback = None;
    let d = driver(&cloud, &dir, s);

    assert_eq!(d.launch("m5.large").await, LaunchOutcome::Failed);
    assert!(d.launched_instances().is_empty());
}

#[tokio::test]
async fn test_slow_launch_times_out_then_falls_back() {
    let cloud = Arc::new(SimulatedCloud::new().with_launch_delay(Duration::from_millis(30)));
    let dir = tempfile::tempdir().unwrap();
    let mut s = settings();
    s.launch_timeout = Duration::from_millis(5);
    let d = driver(&cloud, &dir, s);

    // Both attempts exceed the ceiling.
    assert_eq!(d.launch("r5.large").await, LaunchOutcome::Failed);
}

#[tokio::test]
async fn test_never_running_still_tears_down() {
    let cloud = Arc::new(
        SimulatedCloud::new().with_behavior("t3.nano", TypeBehavior::new().boot_polls(u32::MAX)),
    );
    let dir = tempfile::tempdir().unwrap();
    let report = driver(&cloud, &dir, settings())
        .drive(&WorkItem::new("t3.nano"))
        .await;

    assert!(matches!(report.execution, Some(ExecutionOutcome::NeverRunning(_))));
    assert_eq!(report.teardown, Teardown::Confirmed);
}

#[tokio::test]
async fn test_termination_not_confirmed() {
    let cloud = Arc::new(
        SimulatedCloud::new().with_behavior("i3.large", TypeBehavior::new().stuck_terminating()),
    );
    let dir = tempfile::tempdir().unwrap();
    let report = driver(&cloud, &dir, settings())
        .drive(&WorkItem::new("i3.large"))
        .await;

    assert!(report.collected());
    assert_eq!(report.teardown, Teardown::Unconfirmed);
}

#[tokio::test]
async fn test_fetch_failure_is_collection_failure() {
    let cloud = Arc::new(
        SimulatedCloud::new().with_behavior("d3.xlarge", TypeBehavior::new().fetch_fails()),
    );
    let dir = tempfile::tempdir().unwrap();
    let report = driver(&cloud, &dir, settings())
        .drive(&WorkItem::new("d3.xlarge"))
        .await;

    assert!(matches!(
        report.execution,
        Some(ExecutionOutcome::CollectionFailed(_))
    ));
    assert_eq!(report.teardown, Teardown::Confirmed);
}

#[tokio::test]
async fn test_panicking_execution_still_tears_down() {
    let cloud = Arc::new(SimulatedCloud::new().with_quota(STANDARD_QUOTA, 8.0));
    let dir = tempfile::tempdir().unwrap();
    let mut s = settings();
    // A zero period makes the completion ticker panic after the instance is up.
    s.result_check_interval = Duration::ZERO;
    let report = driver(&cloud, &dir, s).drive(&WorkItem::new("c5.large")).await;

    assert!(matches!(report.execution, Some(ExecutionOutcome::Aborted(_))));
    assert_eq!(report.teardown, Teardown::Confirmed);
    let id = report.instance_id.unwrap();
    assert_eq!(cloud.instance_state(&id), Some(InstanceState::Terminated));
}

#[tokio::test]
async fn test_panicking_sink_still_tears_down() {
    let cloud = Arc::new(SimulatedCloud::new().with_quota(STANDARD_QUOTA, 8.0));
    let d = Driver::new(cloud.clone(), cloud.clone(), Arc::new(ExplodingSink), settings());
    let report = d.drive(&WorkItem::new("m5.large")).await;

    match report.execution {
        Some(ExecutionOutcome::Aborted(reason)) => assert!(reason.contains("disk vanished")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.teardown, Teardown::Confirmed);
    let id = report.instance_id.unwrap();
    assert_eq!(cloud.instance_state(&id), Some(InstanceState::Terminated));
}

#[tokio::test]
async fn test_workload_script_is_shipped_at_launch() {
    let cloud = Arc::new(SimulatedCloud::new());
    let dir = tempfile::tempdir().unwrap();
    let d = driver(&cloud, &dir, settings()).with_user_data("#!/bin/bash\n./bench.sh\n");

    let handle = d.launch("c5.large").await.handle().cloned().unwrap();
    assert_eq!(
        cloud.user_data(&handle.id).as_deref(),
        Some("#!/bin/bash\n./bench.sh\n")
    );
}

#[test]
fn test_settings_validation() {
    assert!(settings().validate().is_ok());

    let mut s = settings();
    s.result_check_interval = Duration::ZERO;
    assert!(s.validate().unwrap_err().contains("result_check_interval"));

    let mut s = settings();
    s.fallback = Some(ResourceClass::Spot);
    assert!(s.validate().is_err());
}
