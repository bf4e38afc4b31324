//! In-memory cloud used by tests and dry runs.
//!
//! [`SimulatedCloud`] implements every collaborator trait. Each instance type
//! can be given a [`TypeBehavior`] to script launch rejection, slow boots,
//! pre-emption, results that never arrive and teardown that never confirms.
//! Live capacity is tracked per quota family from launch until the instance
//! is observed terminated, so tests can check the peak against the limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::core::{
    ActiveConsumer, CostSource, FamilyId, FamilyRules, InstanceDescription, InstanceHandle,
    InstanceState, LiveInstance, ProviderError, ProviderQuota, Provisioner, QuotaDiscovery,
    ResourceClass, ResultChannel,
};

/// Scripted behaviour for one instance type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeBehavior {
    rejected: Vec<ResourceClass>,
    boot_polls: u32,
    preempt_after: Option<u32>,
    completion_polls: u32,
    never_completes: bool,
    fetch_fails: bool,
    terminate_fails: bool,
    stuck_terminating: bool,
    payload: Vec<u8>,
}

impl TypeBehavior {
    /// Launches succeed, boot immediately, complete on the first poll.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject launches with `class`.
    #[must_use]
    pub fn reject(mut self, class: ResourceClass) -> Self {
        self.rejected.push(class);
        self
    }

    /// Stay `Pending` for this many describe calls.
    #[must_use]
    pub const fn boot_polls(mut self, polls: u32) -> Self {
        self.boot_polls = polls;
        self
    }

    /// Leave `Running` after this many describe calls in the running state.
    #[must_use]
    pub const fn preempt_after(mut self, polls: u32) -> Self {
        self.preempt_after = Some(polls);
        self
    }

    /// Report completion only after this many polls.
    #[must_use]
    pub const fn completion_polls(mut self, polls: u32) -> Self {
        self.completion_polls = polls;
        self
    }

    /// Never report completion.
    #[must_use]
    pub const fn never_completes(mut self) -> Self {
        self.never_completes = true;
        self
    }

    /// Fail every result download.
    #[must_use]
    pub const fn fetch_fails(mut self) -> Self {
        self.fetch_fails = true;
        self
    }

    /// Reject termination requests.
    #[must_use]
    pub const fn terminate_fails(mut self) -> Self {
        self.terminate_fails = true;
        self
    }

    /// Accept termination but never reach `Terminated`.
    #[must_use]
    pub const fn stuck_terminating(mut self) -> Self {
        self.stuck_terminating = true;
        self
    }

    /// Payload served once complete.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

#[derive(Debug)]
struct SimInstance {
    handle: InstanceHandle,
    family: Option<FamilyId>,
    cost: u32,
    user_data: String,
    state: InstanceState,
    describes: u32,
    running_describes: u32,
    completion_polls: u32,
    counted_live: bool,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    instances: HashMap<String, SimInstance>,
    live: HashMap<FamilyId, u32>,
    peak: HashMap<FamilyId, u32>,
    launches: Vec<InstanceHandle>,
}

impl SimState {
    fn retire(&mut self, id: &str) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if !instance.counted_live {
            return;
        }
        instance.counted_live = false;
        if let Some(family) = &instance.family {
            if let Some(live) = self.live.get_mut(family) {
                *live = live.saturating_sub(instance.cost);
            }
        }
    }
}

/// Scriptable in-memory provider.
pub struct SimulatedCloud {
    marker: String,
    quotas: Vec<ProviderQuota>,
    rules: FamilyRules,
    consumers: Vec<ActiveConsumer>,
    costs: HashMap<String, u32>,
    behaviors: HashMap<String, TypeBehavior>,
    launch_delay: Duration,
    fail_limits: bool,
    fail_consumers: bool,
    fail_costs: bool,
    cost_calls: AtomicUsize,
    state: Mutex<SimState>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    /// Empty cloud using the `Spot Instance Requests` quota marker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            marker: "Spot Instance Requests".into(),
            quotas: Vec::new(),
            rules: FamilyRules::default(),
            consumers: Vec::new(),
            costs: HashMap::new(),
            behaviors: HashMap::new(),
            launch_delay: Duration::ZERO,
            fail_limits: false,
            fail_consumers: false,
            fail_costs: false,
            cost_calls: AtomicUsize::new(0),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Add a provider quota, e.g. `("All G and VT Spot Instance Requests", 64.0)`.
    #[must_use]
    pub fn with_quota(mut self, name: impl Into<String>, value: f64) -> Self {
        self.quotas.push(ProviderQuota {
            name: name.into(),
            value,
        });
        if let Ok((rules, _)) = FamilyRules::from_provider_quotas(&self.quotas, &self.marker) {
            self.rules = rules;
        }
        self
    }

    /// Add externally owned running instances.
    #[must_use]
    pub fn with_consumer(mut self, instance_type: impl Into<String>, count: u32) -> Self {
        self.consumers.push(ActiveConsumer {
            instance_type: instance_type.into(),
            count,
        });
        self
    }

    /// Set the capacity cost of a type.
    #[must_use]
    pub fn with_cost(mut self, instance_type: impl Into<String>, cost: u32) -> Self {
        self.costs.insert(instance_type.into(), cost);
        self
    }

    /// Script a type's behaviour.
    #[must_use]
    pub fn with_behavior(mut self, instance_type: impl Into<String>, behavior: TypeBehavior) -> Self {
        self.behaviors.insert(instance_type.into(), behavior);
        self
    }

    /// Delay every launch.
    #[must_use]
    pub const fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Fail `list_limits`.
    #[must_use]
    pub const fn failing_limits(mut self) -> Self {
        self.fail_limits = true;
        self
    }

    /// Fail `list_active_consumers`.
    #[must_use]
    pub const fn failing_consumers(mut self) -> Self {
        self.fail_consumers = true;
        self
    }

    /// Fail `describe_costs`.
    #[must_use]
    pub const fn failing_costs(mut self) -> Self {
        self.fail_costs = true;
        self
    }

    /// Number of `describe_costs` calls served.
    #[must_use]
    pub fn describe_cost_calls(&self) -> usize {
        self.cost_calls.load(Ordering::Relaxed)
    }

    /// Capacity units of `family` currently held by launched, not yet
    /// terminated instances.
    #[must_use]
    pub fn live_units(&self, family: &FamilyId) -> u32 {
        self.state.lock().live.get(family).copied().unwrap_or_default()
    }

    /// Highest value [`live_units`](Self::live_units) ever reached.
    #[must_use]
    pub fn peak_units(&self, family: &FamilyId) -> u32 {
        self.state.lock().peak.get(family).copied().unwrap_or_default()
    }

    /// Every successful launch in order.
    #[must_use]
    pub fn launches(&self) -> Vec<InstanceHandle> {
        self.state.lock().launches.clone()
    }

    /// Workload script an instance was launched with.
    #[must_use]
    pub fn user_data(&self, id: &str) -> Option<String> {
        self.state.lock().instances.get(id).map(|i| i.user_data.clone())
    }

    /// Current state of an instance.
    #[must_use]
    pub fn instance_state(&self, id: &str) -> Option<InstanceState> {
        self.state.lock().instances.get(id).map(|i| i.state)
    }

    fn behavior(&self, instance_type: &str) -> TypeBehavior {
        self.behaviors.get(instance_type).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Provisioner for SimulatedCloud {
    async fn launch(
        &self,
        instance_type: &str,
        class: ResourceClass,
        user_data: &str,
    ) -> Result<InstanceHandle, ProviderError> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let behavior = self.behavior(instance_type);
        if behavior.rejected.contains(&class) {
            return Err(ProviderError::LaunchRejected(format!(
                "{class} capacity unavailable for {instance_type}"
            )));
        }

        let family = self.rules.classify(instance_type).cloned();
        let cost = self.costs.get(instance_type).copied().unwrap_or_default();

        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = InstanceHandle {
            id: format!("i-{:08x}", state.next_id),
            instance_type: instance_type.to_owned(),
            class,
        };
        if let Some(family) = &family {
            let live = state.live.entry(family.clone()).or_default();
            *live += cost;
            let now = *live;
            let peak = state.peak.entry(family.clone()).or_default();
            *peak = (*peak).max(now);
        }
        state.instances.insert(
            handle.id.clone(),
            SimInstance {
                handle: handle.clone(),
                family,
                cost,
                user_data: user_data.to_owned(),
                state: InstanceState::Pending,
                describes: 0,
                running_describes: 0,
                completion_polls: 0,
                counted_live: true,
            },
        );
        state.launches.push(handle.clone());
        debug!(instance_id = %handle.id, instance_type, %class, "simulated launch");
        Ok(handle)
    }

    async fn describe(&self, handle: &InstanceHandle) -> Result<InstanceDescription, ProviderError> {
        let mut state = self.state.lock();
        let behavior = self.behavior(&handle.instance_type);
        let instance = state
            .instances
            .get_mut(&handle.id)
            .ok_or_else(|| ProviderError::NotFound(handle.id.clone()))?;

        instance.describes += 1;
        match instance.state {
            InstanceState::Pending if instance.describes > behavior.boot_polls => {
                instance.state = InstanceState::Running;
            }
            InstanceState::Running => {
                instance.running_describes += 1;
                if behavior
                    .preempt_after
                    .is_some_and(|n| instance.running_describes > n)
                {
                    instance.state = InstanceState::ShuttingDown;
                }
            }
            _ => {}
        }

        let description = InstanceDescription {
            state: instance.state,
            address: (instance.state == InstanceState::Running).then(|| "127.0.0.1".to_owned()),
        };
        if description.state == InstanceState::Terminated {
            state.retire(&handle.id);
        }
        Ok(description)
    }

    async fn terminate(&self, handle: &InstanceHandle) -> Result<(), ProviderError> {
        let behavior = self.behavior(&handle.instance_type);
        if behavior.terminate_fails {
            return Err(ProviderError::Transport(format!(
                "terminate {} rejected",
                handle.id
            )));
        }
        let mut state = self.state.lock();
        let instance = state
            .instances
            .get_mut(&handle.id)
            .ok_or_else(|| ProviderError::NotFound(handle.id.clone()))?;
        instance.state = if behavior.stuck_terminating {
            InstanceState::ShuttingDown
        } else {
            InstanceState::Terminated
        };
        Ok(())
    }
}

#[async_trait]
impl QuotaDiscovery for SimulatedCloud {
    async fn list_limits(&self) -> Result<Vec<ProviderQuota>, ProviderError> {
        if self.fail_limits {
            return Err(ProviderError::Transport("quota service unavailable".into()));
        }
        Ok(self.quotas.clone())
    }

    async fn list_active_consumers(&self) -> Result<Vec<ActiveConsumer>, ProviderError> {
        if self.fail_consumers {
            return Err(ProviderError::Transport("instance listing unavailable".into()));
        }
        Ok(self.consumers.clone())
    }
}

#[async_trait]
impl CostSource for SimulatedCloud {
    async fn describe_costs(
        &self,
        instance_types: &[String],
    ) -> Result<HashMap<String, u32>, ProviderError> {
        self.cost_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_costs {
            return Err(ProviderError::Transport("describe instance types failed".into()));
        }
        Ok(instance_types
            .iter()
            .filter_map(|t| self.costs.get(t).map(|&c| (t.clone(), c)))
            .collect())
    }
}

#[async_trait]
impl ResultChannel for SimulatedCloud {
    async fn poll_completion(&self, instance: &LiveInstance) -> Result<bool, ProviderError> {
        let behavior = self.behavior(&instance.handle.instance_type);
        if behavior.never_completes {
            return Ok(false);
        }
        let mut state = self.state.lock();
        let sim = state
            .instances
            .get_mut(&instance.handle.id)
            .ok_or_else(|| ProviderError::NotFound(instance.handle.id.clone()))?;
        sim.completion_polls += 1;
        Ok(sim.completion_polls > behavior.completion_polls)
    }

    async fn fetch_result(&self, instance: &LiveInstance) -> Result<Vec<u8>, ProviderError> {
        let behavior = self.behavior(&instance.handle.instance_type);
        if behavior.fetch_fails {
            return Err(ProviderError::Transport("connection reset".into()));
        }
        if behavior.payload.is_empty() {
            return Ok(instance.handle.instance_type.as_bytes().to_vec());
        }
        Ok(behavior.payload)
    }
}
