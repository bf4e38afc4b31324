//! Audit sink implementations.
//!
//! The scheduler records one event per admission decision so a run can be
//! reconstructed afterwards.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::util::clock::now_ms;

/// Scheduling decision recorded by the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Item admitted and capacity debited.
    Admit,
    /// Item removed from the queue without consuming capacity.
    Drop,
    /// Capacity credited back after confirmed teardown.
    Release,
    /// Capacity kept because teardown could not be confirmed.
    Withhold,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Admit => "admit",
            Self::Drop => "drop",
            Self::Release => "release",
            Self::Withhold => "withhold",
        };
        f.write_str(name)
    }
}

/// Audit event structure.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Instance type the decision concerns.
    pub instance_type: String,
    /// Quota family, when known.
    pub family: Option<String>,
    /// Action taken.
    pub action: AuditAction,
    /// Capacity units involved, when known.
    pub cost: Option<u32>,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context (drop reason, remaining capacity).
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(1024)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Sink that forwards into a shared in-memory buffer, so tests can keep a
/// handle after giving the sink to the scheduler.
pub struct SharedAuditSink {
    inner: std::sync::Arc<parking_lot::Mutex<InMemoryAuditSink>>,
}

impl SharedAuditSink {
    /// Wrap a shared buffer.
    #[must_use]
    pub const fn new(inner: std::sync::Arc<parking_lot::Mutex<InMemoryAuditSink>>) -> Self {
        Self { inner }
    }
}

impl AuditSink for SharedAuditSink {
    fn record(&mut self, event: AuditEvent) {
        self.inner.lock().record(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    instance_type: impl Into<String>,
    family: Option<String>,
    action: AuditAction,
    cost: Option<u32>,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        instance_type: instance_type.into(),
        family,
        action,
        cost,
        created_at_ms: now_ms(),
        detail,
    }
}
