//! Core scheduling abstractions and capacity accounting.

pub mod audit;
pub mod catalog;
pub mod driver;
pub mod error;
pub mod provider;
pub mod quota;
pub mod scheduler;
pub mod worker_pool;

pub use audit::{
    build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, SharedAuditSink,
};
pub use catalog::{family_tokens, CapacityCatalog, FamilyId, FamilyRule, FamilyRules};
pub use driver::{
    DriveReport, Driver, DriverSettings, ExecutionOutcome, LaunchKind, LaunchOutcome,
};
pub use error::{AppResult, HarvestError, ProviderError};
pub use provider::{
    ActiveConsumer, CostSource, InstanceDescription, InstanceHandle, InstanceState, LiveInstance,
    ProviderQuota, Provisioner, QuotaDiscovery, ResourceClass, ResultChannel, ResultSink,
};
pub use quota::{Fit, QuotaEntry, QuotaTable};
pub use scheduler::{
    Admission, AdmissionId, AdmissionScheduler, DropReason, PendingItem, SchedulerStats, Teardown,
    TryAcquire, WorkItem,
};
pub use worker_pool::{HarvestPool, HarvestReport, WorkerEvent};
