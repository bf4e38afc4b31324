//! Per-item provisioning and collection driver.
//!
//! Drives one admitted item through launch (with one fallback class), the
//! wait for `Running`, completion polling, result collection and teardown.
//! Every external wait has its own ceiling; the scheduler is never involved.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::HarvestConfig;
use crate::core::{
    InstanceHandle, InstanceState, LiveInstance, ProviderError, Provisioner, ResourceClass,
    ResultChannel, ResultSink, Teardown, WorkItem,
};

/// Timing and class settings for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    /// First purchasing option tried.
    pub primary: ResourceClass,
    /// Single fallback tried when the primary fails.
    pub fallback: Option<ResourceClass>,
    /// Ceiling for one launch attempt.
    pub launch_timeout: Duration,
    /// Ceiling for reaching `Running` after launch.
    pub start_timeout: Duration,
    /// Interval between state checks while waiting to start or terminate.
    pub state_poll_interval: Duration,
    /// Interval between completion checks.
    pub result_check_interval: Duration,
    /// Ceiling for the whole workload run.
    pub experiment_timeout: Duration,
    /// Ceiling for confirming termination.
    pub termination_timeout: Duration,
}

impl From<&HarvestConfig> for DriverSettings {
    fn from(cfg: &HarvestConfig) -> Self {
        Self {
            primary: cfg.primary_class,
            fallback: cfg.fallback_class,
            launch_timeout: cfg.launch_timeout(),
            start_timeout: cfg.start_timeout(),
            state_poll_interval: cfg.state_poll_interval(),
            result_check_interval: cfg.result_check_interval(),
            experiment_timeout: cfg.experiment_timeout(),
            termination_timeout: cfg.termination_timeout(),
        }
    }
}

impl DriverSettings {
    /// Reject settings the driver cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first zero duration, or a fallback class
    /// equal to the primary.
    pub fn validate(&self) -> Result<(), String> {
        let durations = [
            ("launch_timeout", self.launch_timeout),
            ("start_timeout", self.start_timeout),
            ("state_poll_interval", self.state_poll_interval),
            ("result_check_interval", self.result_check_interval),
            ("experiment_timeout", self.experiment_timeout),
            ("termination_timeout", self.termination_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(format!("{name} must be greater than 0"));
        }
        if self.fallback == Some(self.primary) {
            return Err("fallback class must differ from the primary class".into());
        }
        Ok(())
    }
}

/// Result of the two-step launch pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The primary class launched.
    Primary(InstanceHandle),
    /// The primary failed and the fallback launched.
    Fallback(InstanceHandle),
    /// Every attempt failed; nothing is running.
    Failed,
}

impl LaunchOutcome {
    /// Handle of the launched instance, if any.
    #[must_use]
    pub const fn handle(&self) -> Option<&InstanceHandle> {
        match self {
            Self::Primary(h) | Self::Fallback(h) => Some(h),
            Self::Failed => None,
        }
    }

    /// Outcome without the handle.
    #[must_use]
    pub const fn kind(&self) -> LaunchKind {
        match self {
            Self::Primary(_) => LaunchKind::Primary,
            Self::Fallback(_) => LaunchKind::Fallback,
            Self::Failed => LaunchKind::Failed,
        }
    }
}

/// Which launch step succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    /// Primary class.
    Primary,
    /// Fallback class.
    Fallback,
    /// Nothing launched.
    Failed,
}

/// How the workload run on a launched instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Result fetched and persisted.
    Collected {
        /// Where the payload was written.
        path: PathBuf,
        /// Payload size.
        bytes: usize,
    },
    /// The instance never reached `Running`.
    NeverRunning(String),
    /// The instance left `Running` before completion (e.g. spot reclaim).
    Preempted(InstanceState),
    /// The provider no longer knows the instance.
    Vanished,
    /// No completion signal within the experiment ceiling.
    TimedOut,
    /// Completion was signalled but fetching or persisting failed.
    CollectionFailed(String),
    /// Execution panicked; the instance was still torn down.
    Aborted(String),
}

impl ExecutionOutcome {
    /// True when a result was persisted.
    #[must_use]
    pub const fn is_collected(&self) -> bool {
        matches!(self, Self::Collected { .. })
    }
}

/// Everything that happened to one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveReport {
    /// Instance type driven.
    pub instance_type: String,
    /// Launch pipeline outcome.
    pub launch: LaunchKind,
    /// Provider id of the launched instance.
    pub instance_id: Option<String>,
    /// Workload outcome, when something launched.
    pub execution: Option<ExecutionOutcome>,
    /// Teardown outcome; decides whether capacity is returned.
    pub teardown: Teardown,
}

impl DriveReport {
    /// True when the item's result was collected.
    #[must_use]
    pub fn collected(&self) -> bool {
        self.execution.as_ref().is_some_and(ExecutionOutcome::is_collected)
    }
}

/// Drives items against the external collaborators.
pub struct Driver {
    provisioner: Arc<dyn Provisioner>,
    results: Arc<dyn ResultChannel>,
    sink: Arc<dyn ResultSink>,
    settings: DriverSettings,
    user_data: String,
    launched: Mutex<Vec<String>>,
}

impl Driver {
    /// Create a driver.
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        results: Arc<dyn ResultChannel>,
        sink: Arc<dyn ResultSink>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            provisioner,
            results,
            sink,
            settings,
            user_data: String::new(),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Ship `script` to every launched instance as its boot workload.
    #[must_use]
    pub fn with_user_data(mut self, script: impl Into<String>) -> Self {
        self.user_data = script.into();
        self
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Ids of every instance this driver launched.
    #[must_use]
    pub fn launched_instances(&self) -> Vec<String> {
        self.launched.lock().clone()
    }

    /// Run one item end to end. Teardown is always attempted once something
    /// launched, including when execution panics.
    pub async fn drive(&self, item: &WorkItem) -> DriveReport {
        let instance_type = item.instance_type();
        let launch = self.launch(instance_type).await;
        let Some(handle) = launch.handle().cloned() else {
            return DriveReport {
                instance_type: instance_type.to_owned(),
                launch: LaunchKind::Failed,
                instance_id: None,
                execution: None,
                teardown: Teardown::NotLaunched,
            };
        };
        self.launched.lock().push(handle.id.clone());

        let execution = match AssertUnwindSafe(self.execute(&handle)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(instance_type, instance_id = %handle.id, %reason, "execution panicked");
                ExecutionOutcome::Aborted(reason)
            }
        };
        let teardown = self.teardown(&handle).await;

        DriveReport {
            instance_type: instance_type.to_owned(),
            launch: launch.kind(),
            instance_id: Some(handle.id),
            execution: Some(execution),
            teardown,
        }
    }

    /// Try the primary class, then the fallback once.
    pub async fn launch(&self, instance_type: &str) -> LaunchOutcome {
        let primary = self.settings.primary;
        match self.attempt(instance_type, primary).await {
            Ok(handle) => return LaunchOutcome::Primary(handle),
            Err(e) => warn!(instance_type, class = %primary, error = %e, "launch failed"),
        }

        let Some(fallback) = self.settings.fallback else {
            return LaunchOutcome::Failed;
        };
        info!(instance_type, class = %fallback, "falling back");
        match self.attempt(instance_type, fallback).await {
            Ok(handle) => LaunchOutcome::Fallback(handle),
            Err(e) => {
                warn!(instance_type, class = %fallback, error = %e, "fallback launch failed");
                LaunchOutcome::Failed
            }
        }
    }

    async fn attempt(
        &self,
        instance_type: &str,
        class: ResourceClass,
    ) -> Result<InstanceHandle, ProviderError> {
        debug!(instance_type, %class, "requesting instance");
        match timeout(
            self.settings.launch_timeout,
            self.provisioner.launch(instance_type, class, &self.user_data),
        )
        .await
        {
            Ok(result) => {
                if let Ok(handle) = &result {
                    info!(instance_type, %class, instance_id = %handle.id, "instance launched");
                }
                result
            }
            Err(_) => Err(ProviderError::Timeout(format!(
                "{class} launch of {instance_type} exceeded {:?}",
                self.settings.launch_timeout
            ))),
        }
    }

    /// Wait for the instance to run, then poll for completion and collect.
    pub async fn execute(&self, handle: &InstanceHandle) -> ExecutionOutcome {
        let live = match self.await_running(handle).await {
            Ok(live) => live,
            Err(reason) => {
                warn!(instance_id = %handle.id, %reason, "instance did not reach running state");
                return ExecutionOutcome::NeverRunning(reason);
            }
        };

        let started = Instant::now();
        let polling = async {
            let mut ticker = interval(self.settings.result_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the first check waits a full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;

                match self.provisioner.describe(handle).await {
                    Ok(d) if d.state == InstanceState::Running => {}
                    Ok(d) => {
                        warn!(
                            instance_type = %handle.instance_type,
                            instance_id = %handle.id,
                            state = %d.state,
                            "instance no longer running, aborting"
                        );
                        return ExecutionOutcome::Preempted(d.state);
                    }
                    Err(ProviderError::NotFound(_)) => {
                        warn!(instance_id = %handle.id, "instance vanished, aborting");
                        return ExecutionOutcome::Vanished;
                    }
                    Err(e) => {
                        warn!(instance_id = %handle.id, error = %e, "state check failed, retrying next cycle");
                        continue;
                    }
                }

                match self.results.poll_completion(&live).await {
                    Ok(true) => return self.collect(&live).await,
                    Ok(false) => {}
                    Err(e) => debug!(instance_id = %handle.id, error = %e, "completion check failed"),
                }
                debug!(
                    instance_type = %handle.instance_type,
                    elapsed_secs = started.elapsed().as_secs(),
                    "waiting for completion"
                );
            }
        };

        if let Ok(outcome) = timeout(self.settings.experiment_timeout, polling).await {
            outcome
        } else {
            warn!(instance_type = %handle.instance_type, "experiment timed out");
            ExecutionOutcome::TimedOut
        }
    }

    async fn await_running(&self, handle: &InstanceHandle) -> Result<LiveInstance, String> {
        let waiting = async {
            loop {
                match self.provisioner.describe(handle).await {
                    Ok(d) if d.state == InstanceState::Running => {
                        return Ok(LiveInstance {
                            handle: handle.clone(),
                            address: d.address,
                        });
                    }
                    Ok(d) if d.state.is_terminal() => {
                        return Err(format!("entered {} before running", d.state));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(instance_id = %handle.id, error = %e, "describe failed while starting"),
                }
                sleep(self.settings.state_poll_interval).await;
            }
        };
        timeout(self.settings.start_timeout, waiting)
            .await
            .unwrap_or_else(|_| {
                Err(format!(
                    "not running within {:?}",
                    self.settings.start_timeout
                ))
            })
    }

    async fn collect(&self, live: &LiveInstance) -> ExecutionOutcome {
        let instance_type = &live.handle.instance_type;
        info!(instance_type = %instance_type, "experiment completed, downloading results");
        let payload = match self.results.fetch_result(live).await {
            Ok(p) => p,
            Err(e) => {
                warn!(instance_type = %instance_type, error = %e, "result download failed");
                return ExecutionOutcome::CollectionFailed(e.to_string());
            }
        };
        match self.sink.persist(instance_type, &payload) {
            Ok(path) => {
                info!(instance_type = %instance_type, path = %path.display(), bytes = payload.len(), "results stored");
                ExecutionOutcome::Collected {
                    path,
                    bytes: payload.len(),
                }
            }
            Err(e) => {
                warn!(instance_type = %instance_type, error = %e, "failed to store results");
                ExecutionOutcome::CollectionFailed(e.to_string())
            }
        }
    }

    /// Terminate and wait until the provider reports `Terminated`.
    pub async fn teardown(&self, handle: &InstanceHandle) -> Teardown {
        info!(instance_type = %handle.instance_type, instance_id = %handle.id, "terminating instance");
        if let Err(e) = self.provisioner.terminate(handle).await {
            warn!(instance_id = %handle.id, error = %e, "failed to initiate termination");
            return Teardown::Unconfirmed;
        }

        let confirming = async {
            loop {
                match self.provisioner.describe(handle).await {
                    Ok(d) if d.state == InstanceState::Terminated => return,
                    Ok(_) => {}
                    Err(e) => debug!(instance_id = %handle.id, error = %e, "describe failed while terminating"),
                }
                sleep(self.settings.state_poll_interval).await;
            }
        };

        if timeout(self.settings.termination_timeout, confirming).await.is_ok() {
            info!(instance_type = %handle.instance_type, instance_id = %handle.id, "instance terminated");
            Teardown::Confirmed
        } else {
            warn!(instance_id = %handle.id, "termination not confirmed within timeout");
            Teardown::Unconfirmed
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
