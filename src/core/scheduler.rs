//! Quota-aware admission scheduler.
//!
//! The pending queue and the quota table live behind one `parking_lot::Mutex`
//! paired with a `parking_lot::Condvar`. Only the admission decision is made
//! under that lock; provisioning and polling happen in the caller after
//! [`AdmissionScheduler::acquire`] returns.
//!
//! # Admission policy
//!
//! `acquire` scans the queue in insertion order and admits the first item
//! whose family currently has room. An item that does not fit is skipped in
//! favour of a later one that does, so a large item at the head can wait
//! indefinitely while smaller items of busier families keep churning. This is
//! the intended policy; there is no aging.
//!
//! Lock order: scheduler state, then the audit sink.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::quota::{Fit, QuotaEntry, QuotaTable};
use crate::core::{build_audit_event, AuditAction, AuditSink, FamilyId, HarvestError};

/// Identifier of one admission, unique within its scheduler.
pub type AdmissionId = u64;

/// One unit of demand: an instance type to run the workload on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    instance_type: String,
}

impl WorkItem {
    /// Create a work item for `instance_type`.
    pub fn new(instance_type: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
        }
    }

    /// Instance type name.
    #[must_use]
    pub fn instance_type(&self) -> &str {
        &self.instance_type
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.instance_type)
    }
}

/// A queued work item with its catalog resolution.
///
/// `None` for either field marks the item unschedulable; the first scan that
/// reaches it drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    /// The work item.
    pub item: WorkItem,
    /// Resolved quota family.
    pub family: Option<FamilyId>,
    /// Resolved capacity cost.
    pub cost: Option<u32>,
}

impl PendingItem {
    /// Pair an item with its catalog resolution.
    #[must_use]
    pub const fn new(item: WorkItem, family: Option<FamilyId>, cost: Option<u32>) -> Self {
        Self { item, family, cost }
    }
}

/// Exclusive right to hold `cost` units of `family` until released.
///
/// Deliberately not `Clone`: [`AdmissionScheduler::release`] consumes it, so
/// each admission is released at most once. An admission that is dropped
/// without release keeps its capacity for the rest of the process.
#[derive(Debug, PartialEq, Eq)]
pub struct Admission {
    id: AdmissionId,
    scheduler: Uuid,
    item: WorkItem,
    family: FamilyId,
    cost: u32,
}

impl Admission {
    /// Admission identifier.
    #[must_use]
    pub const fn id(&self) -> AdmissionId {
        self.id
    }

    /// Admitted work item.
    #[must_use]
    pub const fn item(&self) -> &WorkItem {
        &self.item
    }

    /// Family the capacity was debited from.
    #[must_use]
    pub const fn family(&self) -> &FamilyId {
        &self.family
    }

    /// Units debited.
    #[must_use]
    pub const fn cost(&self) -> u32 {
        self.cost
    }
}

/// How the live resource behind an admission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Teardown {
    /// No resource was ever launched.
    NotLaunched,
    /// The resource was observed terminated.
    Confirmed,
    /// Termination could not be confirmed; the resource may still be live.
    Unconfirmed,
}

impl Teardown {
    /// Whether releasing with this outcome returns capacity to the family.
    #[must_use]
    pub const fn credits_capacity(self) -> bool {
        !matches!(self, Self::Unconfirmed)
    }
}

/// Why an item left the queue without being admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No quota family matches the instance type.
    UnknownFamily,
    /// The provider returned no cost for the instance type.
    UnknownCost,
    /// The cost exceeds the family's entire baseline.
    ExceedsFamilyCapacity,
    /// Nothing fits and nothing is outstanding, so nothing ever will.
    Starved,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UnknownFamily => "unknown instance family",
            Self::UnknownCost => "cost unavailable",
            Self::ExceedsFamilyCapacity => "cost exceeds family capacity",
            Self::Starved => "no capacity can be freed",
        };
        f.write_str(text)
    }
}

/// Outcome of a non-blocking admission attempt.
#[derive(Debug)]
pub enum TryAcquire {
    /// An item was admitted.
    Admitted(Admission),
    /// Items remain but none fits until something is released.
    Blocked,
    /// The queue is empty; no more admissions will be granted.
    Drained,
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Items waiting in the queue.
    pub pending: usize,
    /// Admissions not yet released.
    pub in_flight: usize,
    /// Total admissions granted.
    pub admitted: u64,
    /// Releases that credited capacity back.
    pub released: u64,
    /// Releases that withheld capacity.
    pub withheld: u64,
    /// Items dropped as unschedulable.
    pub dropped: u64,
}

/// Capacity held by an admission that has not been released.
#[derive(Debug)]
struct Outstanding {
    instance_type: String,
    family: FamilyId,
    cost: u32,
}

/// Everything guarded by the scheduler lock.
struct SchedulerState {
    queue: VecDeque<PendingItem>,
    quotas: QuotaTable,
    outstanding: HashMap<AdmissionId, Outstanding>,
    next_id: AdmissionId,
    admitted: u64,
    released: u64,
    withheld: u64,
    dropped: u64,
}

enum Scan {
    Admitted(Admission),
    NothingFits,
    Empty,
}

/// Owns the pending queue and quota table; hands out [`Admission`]s.
pub struct AdmissionScheduler {
    id: Uuid,
    state: Mutex<SchedulerState>,
    /// Signalled when capacity returns or the queue drains.
    wake: Condvar,
    audit: Option<Mutex<Box<dyn AuditSink>>>,
}

impl AdmissionScheduler {
    /// Create a scheduler over `quotas` with `items` queued in order.
    pub fn new(quotas: QuotaTable, items: impl IntoIterator<Item = PendingItem>) -> Self {
        let queue: VecDeque<PendingItem> = items.into_iter().collect();
        info!(
            pending = queue.len(),
            families = quotas.len(),
            "admission scheduler initialized"
        );
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(SchedulerState {
                queue,
                quotas,
                outstanding: HashMap::new(),
                next_id: 0,
                admitted: 0,
                released: 0,
                withheld: 0,
                dropped: 0,
            }),
            wake: Condvar::new(),
            audit: None,
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Mutex::new(audit));
        self
    }

    /// Block until an item can be admitted, or return `None` once the queue
    /// is empty.
    ///
    /// Unschedulable items met during the scan are dropped without touching
    /// capacity. If nothing fits and no admission is outstanding, no release
    /// can ever free capacity; the remaining items are dropped as starved and
    /// `None` is returned to every waiter.
    pub fn acquire(&self) -> Option<Admission> {
        let mut state = self.state.lock();
        loop {
            match self.scan(&mut state) {
                Scan::Admitted(admission) => {
                    // Pass the baton: another waiter may fit in what is left,
                    // or every waiter must see the drained queue.
                    if state.queue.is_empty() {
                        self.wake.notify_all();
                    } else {
                        self.wake.notify_one();
                    }
                    return Some(admission);
                }
                Scan::Empty => {
                    self.wake.notify_all();
                    return None;
                }
                Scan::NothingFits if state.outstanding.is_empty() => {
                    self.drain_starved(&mut state);
                    self.wake.notify_all();
                    return None;
                }
                Scan::NothingFits => {
                    debug!(pending = state.queue.len(), "no queued item fits, waiting for release");
                    self.wake.wait(&mut state);
                }
            }
        }
    }

    /// Non-blocking form of [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> TryAcquire {
        let mut state = self.state.lock();
        match self.scan(&mut state) {
            Scan::Admitted(admission) => TryAcquire::Admitted(admission),
            Scan::Empty => TryAcquire::Drained,
            Scan::NothingFits if state.outstanding.is_empty() => {
                self.drain_starved(&mut state);
                self.wake.notify_all();
                TryAcquire::Drained
            }
            Scan::NothingFits => TryAcquire::Blocked,
        }
    }

    /// Return an admission's capacity according to how its resource ended.
    ///
    /// [`Teardown::Unconfirmed`] keeps the capacity debited: the provider may
    /// still count the resource, and admitting against it could exceed what
    /// the provider actually allows.
    ///
    /// # Errors
    ///
    /// [`HarvestError::UnknownAdmission`] if the admission was not granted by
    /// this scheduler.
    pub fn release(&self, admission: Admission, teardown: Teardown) -> Result<(), HarvestError> {
        if admission.scheduler != self.id {
            return Err(HarvestError::UnknownAdmission(admission.id));
        }
        let mut state = self.state.lock();
        let Some(held) = state.outstanding.remove(&admission.id) else {
            return Err(HarvestError::UnknownAdmission(admission.id));
        };

        if teardown.credits_capacity() {
            state.quotas.credit(&held.family, held.cost);
            state.released += 1;
            let remaining = state.quotas.remaining(&held.family).unwrap_or_default();
            info!(
                instance_type = %held.instance_type,
                family = %held.family,
                cost = held.cost,
                remaining,
                "released capacity"
            );
            self.audit(build_audit_event(
                &held.instance_type,
                Some(held.family.to_string()),
                AuditAction::Release,
                Some(held.cost),
                Some(format!("remaining={remaining}")),
            ));
            if state.queue.is_empty() {
                self.wake.notify_all();
            } else {
                self.wake.notify_one();
            }
        } else {
            state.withheld += 1;
            warn!(
                instance_type = %held.instance_type,
                family = %held.family,
                cost = held.cost,
                "teardown unconfirmed; capacity withheld for the rest of the run"
            );
            self.audit(build_audit_event(
                &held.instance_type,
                Some(held.family.to_string()),
                AuditAction::Withhold,
                Some(held.cost),
                None,
            ));
            // Waiters must still observe a drained or stalled queue.
            if state.queue.is_empty() || state.outstanding.is_empty() {
                self.wake.notify_all();
            }
        }
        Ok(())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            pending: state.queue.len(),
            in_flight: state.outstanding.len(),
            admitted: state.admitted,
            released: state.released,
            withheld: state.withheld,
            dropped: state.dropped,
        }
    }

    /// Remaining units for `family`.
    #[must_use]
    pub fn remaining(&self, family: &FamilyId) -> Option<u32> {
        self.state.lock().quotas.remaining(family)
    }

    /// Accounting for every family.
    #[must_use]
    pub fn quota_snapshot(&self) -> Vec<(FamilyId, QuotaEntry)> {
        self.state.lock().quotas.snapshot()
    }

    /// Items still waiting.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// One pass over the queue in order.
    fn scan(&self, state: &mut MutexGuard<'_, SchedulerState>) -> Scan {
        let mut i = 0;
        while i < state.queue.len() {
            let (family, cost) = {
                let entry = &state.queue[i];
                (entry.family.clone(), entry.cost)
            };
            let verdict = match (family, cost) {
                (None, _) => Err(DropReason::UnknownFamily),
                (Some(_), None) => Err(DropReason::UnknownCost),
                (Some(family), Some(cost)) => match state.quotas.fit(&family, cost) {
                    Fit::Fits => Ok((family, cost)),
                    Fit::Insufficient => {
                        i += 1;
                        continue;
                    }
                    Fit::NeverFits => Err(DropReason::ExceedsFamilyCapacity),
                    Fit::UnknownFamily => Err(DropReason::UnknownFamily),
                },
            };

            let Some(pending) = state.queue.remove(i) else {
                break;
            };
            match verdict {
                Ok((family, cost)) => return Scan::Admitted(self.admit(state, pending, family, cost)),
                Err(reason) => self.drop_item(state, &pending, reason),
            }
        }

        if state.queue.is_empty() {
            Scan::Empty
        } else {
            Scan::NothingFits
        }
    }

    fn admit(
        &self,
        state: &mut SchedulerState,
        pending: PendingItem,
        family: FamilyId,
        cost: u32,
    ) -> Admission {
        let available = state.quotas.remaining(&family).unwrap_or_default();
        let debited = state.quotas.debit(&family, cost);
        debug_assert!(debited, "admitted {} without capacity", pending.item);

        let id = state.next_id;
        state.next_id += 1;
        state.admitted += 1;
        state.outstanding.insert(
            id,
            Outstanding {
                instance_type: pending.item.instance_type().to_owned(),
                family: family.clone(),
                cost,
            },
        );

        info!(
            instance_type = %pending.item,
            family = %family,
            cost,
            available,
            "admitted"
        );
        self.audit(build_audit_event(
            pending.item.instance_type(),
            Some(family.to_string()),
            AuditAction::Admit,
            Some(cost),
            Some(format!("available={available}")),
        ));

        Admission {
            id,
            scheduler: self.id,
            item: pending.item,
            family,
            cost,
        }
    }

    fn drop_item(&self, state: &mut SchedulerState, pending: &PendingItem, reason: DropReason) {
        state.dropped += 1;
        warn!(instance_type = %pending.item, %reason, "dropping unschedulable item");
        self.audit(build_audit_event(
            pending.item.instance_type(),
            pending.family.as_ref().map(ToString::to_string),
            AuditAction::Drop,
            pending.cost,
            Some(reason.to_string()),
        ));
    }

    fn drain_starved(&self, state: &mut SchedulerState) {
        let starved: Vec<PendingItem> = state.queue.drain(..).collect();
        for pending in &starved {
            self.drop_item(state, pending, DropReason::Starved);
        }
    }

    fn audit(&self, event: crate::core::AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.lock().record(event);
        }
    }
}
