//! Harvest run configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{HarvestError, ResourceClass};

/// Settings for one harvest run: pool size, launch classes, every external
/// wait ceiling, and where results land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Purchasing option tried first.
    pub primary_class: ResourceClass,
    /// Purchasing option tried once when the primary fails; `None` disables fallback.
    pub fallback_class: Option<ResourceClass>,
    /// Ceiling for one launch attempt.
    pub launch_timeout_ms: u64,
    /// Ceiling for an instance to reach `Running`.
    pub start_timeout_ms: u64,
    /// Interval between state checks while starting or terminating.
    pub state_poll_interval_ms: u64,
    /// Interval between completion checks.
    pub result_check_interval_ms: u64,
    /// Ceiling for the workload run on one instance.
    pub experiment_timeout_ms: u64,
    /// Ceiling for confirming termination.
    pub termination_timeout_ms: u64,
    /// Ceiling for one result-channel request.
    pub http_timeout_ms: u64,
    /// Port the workload serves its status and result files on.
    pub result_port: u16,
    /// Substring identifying the quotas that define instance families.
    pub quota_name_marker: String,
    /// Root directory for collected results.
    pub result_dir: PathBuf,
    /// Stack size for worker threads in bytes.
    pub thread_stack_size: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            worker_count: 47,
            primary_class: ResourceClass::Spot,
            fallback_class: Some(ResourceClass::OnDemand),
            launch_timeout_ms: 60_000,
            start_timeout_ms: 60_000,
            state_poll_interval_ms: 5_000,
            result_check_interval_ms: 30_000,
            experiment_timeout_ms: 5 * 60 * 60 * 1_000,
            termination_timeout_ms: 5 * 60 * 1_000,
            http_timeout_ms: 30 * 60 * 1_000,
            result_port: 8080,
            quota_name_marker: "Spot Instance Requests".into(),
            result_dir: PathBuf::from("result"),
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl HarvestConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the primary purchasing option.
    #[must_use]
    pub const fn with_primary_class(mut self, class: ResourceClass) -> Self {
        self.primary_class = class;
        self
    }

    /// Set or disable the fallback purchasing option.
    #[must_use]
    pub const fn with_fallback_class(mut self, class: Option<ResourceClass>) -> Self {
        self.fallback_class = class;
        self
    }

    /// Set the launch attempt ceiling.
    #[must_use]
    pub const fn with_launch_timeout_ms(mut self, ms: u64) -> Self {
        self.launch_timeout_ms = ms;
        self
    }

    /// Set the start ceiling.
    #[must_use]
    pub const fn with_start_timeout_ms(mut self, ms: u64) -> Self {
        self.start_timeout_ms = ms;
        self
    }

    /// Set the state poll interval.
    #[must_use]
    pub const fn with_state_poll_interval_ms(mut self, ms: u64) -> Self {
        self.state_poll_interval_ms = ms;
        self
    }

    /// Set the completion check interval.
    #[must_use]
    pub const fn with_result_check_interval_ms(mut self, ms: u64) -> Self {
        self.result_check_interval_ms = ms;
        self
    }

    /// Set the experiment ceiling.
    #[must_use]
    pub const fn with_experiment_timeout_ms(mut self, ms: u64) -> Self {
        self.experiment_timeout_ms = ms;
        self
    }

    /// Set the termination ceiling.
    #[must_use]
    pub const fn with_termination_timeout_ms(mut self, ms: u64) -> Self {
        self.termination_timeout_ms = ms;
        self
    }

    /// Set the result-channel request ceiling.
    #[must_use]
    pub const fn with_http_timeout_ms(mut self, ms: u64) -> Self {
        self.http_timeout_ms = ms;
        self
    }

    /// Set the result port.
    #[must_use]
    pub const fn with_result_port(mut self, port: u16) -> Self {
        self.result_port = port;
        self
    }

    /// Set the quota name marker.
    #[must_use]
    pub fn with_quota_name_marker(mut self, marker: impl Into<String>) -> Self {
        self.quota_name_marker = marker.into();
        self
    }

    /// Set the result directory.
    #[must_use]
    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = dir.into();
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Launch attempt ceiling.
    #[must_use]
    pub const fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    /// Start ceiling.
    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// State poll interval.
    #[must_use]
    pub const fn state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.state_poll_interval_ms)
    }

    /// Completion check interval.
    #[must_use]
    pub const fn result_check_interval(&self) -> Duration {
        Duration::from_millis(self.result_check_interval_ms)
    }

    /// Experiment ceiling.
    #[must_use]
    pub const fn experiment_timeout(&self) -> Duration {
        Duration::from_millis(self.experiment_timeout_ms)
    }

    /// Termination ceiling.
    #[must_use]
    pub const fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    /// Result-channel request ceiling.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        let ceilings = [
            ("launch_timeout_ms", self.launch_timeout_ms),
            ("start_timeout_ms", self.start_timeout_ms),
            ("state_poll_interval_ms", self.state_poll_interval_ms),
            ("result_check_interval_ms", self.result_check_interval_ms),
            ("experiment_timeout_ms", self.experiment_timeout_ms),
            ("termination_timeout_ms", self.termination_timeout_ms),
            ("http_timeout_ms", self.http_timeout_ms),
        ];
        if let Some((name, _)) = ceilings.iter().find(|(_, v)| *v == 0) {
            return Err(format!("{name} must be greater than 0"));
        }
        if self.result_check_interval_ms > self.experiment_timeout_ms {
            return Err("result_check_interval_ms must not exceed experiment_timeout_ms".into());
        }
        if self.state_poll_interval_ms > self.start_timeout_ms
            || self.state_poll_interval_ms > self.termination_timeout_ms
        {
            return Err(
                "state_poll_interval_ms must not exceed start_timeout_ms or termination_timeout_ms"
                    .into(),
            );
        }
        if self.fallback_class == Some(self.primary_class) {
            return Err("fallback_class must differ from primary_class".into());
        }
        if self.quota_name_marker.trim().is_empty() {
            return Err("quota_name_marker must not be empty".into());
        }
        if self.result_port == 0 {
            return Err("result_port must be greater than 0".into());
        }
        if self.thread_stack_size == 0 {
            return Err("thread_stack_size must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// [`HarvestError::InvalidConfig`] on parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, HarvestError> {
        let cfg: Self = serde_json::from_str(input)
            .map_err(|e| HarvestError::InvalidConfig(format!("parse error: {e}")))?;
        cfg.validate().map_err(HarvestError::InvalidConfig)?;
        Ok(cfg)
    }

    /// Load defaults overridden by `HARVEST_*` environment variables, reading
    /// a `.env` file first if one exists.
    ///
    /// Recognised variables: `HARVEST_WORKER_COUNT`, `HARVEST_PRIMARY_CLASS`,
    /// `HARVEST_FALLBACK_CLASS` (`none` disables), `HARVEST_RESULT_DIR`,
    /// `HARVEST_RESULT_PORT`, `HARVEST_QUOTA_NAME_MARKER` and each
    /// `HARVEST_<FIELD>_MS` timing field.
    ///
    /// # Errors
    ///
    /// [`HarvestError::InvalidConfig`] if a variable does not parse or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, HarvestError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a caller-supplied variable
    /// lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HarvestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("HARVEST_WORKER_COUNT") {
            cfg.worker_count = parse_var("HARVEST_WORKER_COUNT", &v)?;
        }
        if let Some(v) = lookup("HARVEST_PRIMARY_CLASS") {
            cfg.primary_class = parse_class("HARVEST_PRIMARY_CLASS", &v)?;
        }
        if let Some(v) = lookup("HARVEST_FALLBACK_CLASS") {
            cfg.fallback_class = if v.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_class("HARVEST_FALLBACK_CLASS", &v)?)
            };
        }
        if let Some(v) = lookup("HARVEST_RESULT_DIR") {
            cfg.result_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HARVEST_RESULT_PORT") {
            cfg.result_port = parse_var("HARVEST_RESULT_PORT", &v)?;
        }
        if let Some(v) = lookup("HARVEST_QUOTA_NAME_MARKER") {
            cfg.quota_name_marker = v;
        }

        let timings: [(&str, &mut u64); 7] = [
            ("HARVEST_LAUNCH_TIMEOUT_MS", &mut cfg.launch_timeout_ms),
            ("HARVEST_START_TIMEOUT_MS", &mut cfg.start_timeout_ms),
            ("HARVEST_STATE_POLL_INTERVAL_MS", &mut cfg.state_poll_interval_ms),
            ("HARVEST_RESULT_CHECK_INTERVAL_MS", &mut cfg.result_check_interval_ms),
            ("HARVEST_EXPERIMENT_TIMEOUT_MS", &mut cfg.experiment_timeout_ms),
            ("HARVEST_TERMINATION_TIMEOUT_MS", &mut cfg.termination_timeout_ms),
            ("HARVEST_HTTP_TIMEOUT_MS", &mut cfg.http_timeout_ms),
        ];
        for (key, slot) in timings {
            if let Some(v) = lookup(key) {
                *slot = parse_var(key, &v)?;
            }
        }

        cfg.validate().map_err(HarvestError::InvalidConfig)?;
        Ok(cfg)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, HarvestError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| HarvestError::InvalidConfig(format!("{key}={value}: {e}")))
}

fn parse_class(key: &str, value: &str) -> Result<ResourceClass, HarvestError> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "spot" => Ok(ResourceClass::Spot),
        "on_demand" => Ok(ResourceClass::OnDemand),
        other => Err(HarvestError::InvalidConfig(format!(
            "{key}: unknown resource class `{other}`"
        ))),
    }
}
