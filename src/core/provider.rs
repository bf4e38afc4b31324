//! External collaborator traits and the value types that cross them.
//!
//! The scheduler never talks to a cloud provider directly. Everything that
//! crosses the network goes through one of these traits so that the
//! admission core can be exercised against [`crate::infra::simulated`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{HarvestError, ProviderError};

/// Purchasing option used for a launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Interruptible spare capacity.
    Spot,
    /// Regular on-demand capacity.
    OnDemand,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Lifecycle state reported by the provider for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Accepted but not yet booted.
    Pending,
    /// Booted and running the workload.
    Running,
    /// Termination in progress.
    ShuttingDown,
    /// Stop in progress.
    Stopping,
    /// Stopped; still holds an allocation.
    Stopped,
    /// Gone for good.
    Terminated,
}

impl InstanceState {
    /// True when the instance can no longer reach `Running` without outside help.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ShuttingDown | Self::Stopping | Self::Stopped | Self::Terminated
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Provider handle for a launched instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Provider-assigned instance identifier.
    pub id: String,
    /// Instance type that was launched.
    pub instance_type: String,
    /// Purchasing option the launch succeeded with.
    pub class: ResourceClass,
}

/// Result of a `describe` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Reachable address once the instance is running.
    pub address: Option<String>,
}

/// A running instance together with the address results are served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInstance {
    /// Provider handle.
    pub handle: InstanceHandle,
    /// Address reported when the instance reached `Running`.
    pub address: Option<String>,
}

/// One quota as reported by the provider's quota service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQuota {
    /// Human-readable quota name, e.g. `All G and VT Spot Instance Requests`.
    pub name: String,
    /// Quota value in capacity units.
    pub value: f64,
}

/// Instances of one type that already consume quota outside this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConsumer {
    /// Instance type name.
    pub instance_type: String,
    /// Number of live instances of that type.
    pub count: u32,
}

/// Launch, inspect and terminate instances.
///
/// Implementations must be cancellation-safe for `launch`: the driver bounds
/// each attempt with a timeout and drops the future when it expires, so a
/// pending provider request has to be withdrawn by the implementation.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Launch one instance of `instance_type` with the given purchasing option.
    ///
    /// `user_data` is the workload script the instance runs at boot; empty
    /// when the driver was built without one.
    async fn launch(
        &self,
        instance_type: &str,
        class: ResourceClass,
        user_data: &str,
    ) -> Result<InstanceHandle, ProviderError>;

    /// Report the current state of an instance.
    async fn describe(&self, handle: &InstanceHandle) -> Result<InstanceDescription, ProviderError>;

    /// Request termination. Success only means the request was accepted.
    async fn terminate(&self, handle: &InstanceHandle) -> Result<(), ProviderError>;
}

/// Startup-only view of the provider's quota accounting.
#[async_trait]
pub trait QuotaDiscovery: Send + Sync {
    /// All quotas for the compute service.
    async fn list_limits(&self) -> Result<Vec<ProviderQuota>, ProviderError>;

    /// Live instances, created elsewhere, that count against the same quotas.
    async fn list_active_consumers(&self) -> Result<Vec<ActiveConsumer>, ProviderError>;
}

/// Batched capacity-cost lookup.
#[async_trait]
pub trait CostSource: Send + Sync {
    /// Return the capacity units for each known type. Unknown types are
    /// simply absent from the map.
    async fn describe_costs(
        &self,
        instance_types: &[String],
    ) -> Result<HashMap<String, u32>, ProviderError>;
}

/// Completion signal and result payload served by a running instance.
#[async_trait]
pub trait ResultChannel: Send + Sync + 'static {
    /// `true` once the workload has signalled completion.
    async fn poll_completion(&self, instance: &LiveInstance) -> Result<bool, ProviderError>;

    /// Download the result payload.
    async fn fetch_result(&self, instance: &LiveInstance) -> Result<Vec<u8>, ProviderError>;
}

/// Durable destination for collected payloads.
pub trait ResultSink: Send + Sync + 'static {
    /// Persist `payload` for `instance_type` and return where it landed.
    fn persist(&self, instance_type: &str, payload: &[u8]) -> Result<PathBuf, HarvestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!InstanceState::Pending.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
        assert!(InstanceState::ShuttingDown.is_terminal());
        assert!(InstanceState::Terminated.is_terminal());
    }

    #[test]
    fn class_serde_names() {
        let json = serde_json::to_string(&ResourceClass::OnDemand).unwrap();
        assert_eq!(json, "\"on_demand\"");
        assert_eq!(ResourceClass::Spot.to_string(), "spot");
    }
}
