//! Structured audit events emitted on every state change.
//!
//! Events are the coordinator's voice: an append-only record of what was
//! admitted, retired, deferred, and retuned. The ledger carries only the
//! next sequence number; the events themselves live in a JSONL sidecar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Timing, WorkId};

/// A structured audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkAdded {
        id: WorkId,
        priority: u8,
        timing: Timing,
        tier: String,
    },
    WorkAdmitted {
        id: WorkId,
        score: u32,
        agent: Option<String>,
    },
    WorkCompleted {
        id: WorkId,
        result_location: Option<std::path::PathBuf>,
    },
    WorkFailed {
        id: WorkId,
        reason: String,
        retry_count: u32,
    },
    WorkRequeued {
        id: WorkId,
        scheduled_for: Option<DateTime<Utc>>,
    },
    WorkPermanentlyFailed {
        id: WorkId,
        reason: String,
        retry_count: u32,
    },
    /// Admission skipped for budget reasons; the item stays Queued.
    WorkDeferred {
        id: WorkId,
        tier: String,
        requested: u64,
        usable: u64,
    },
    QuotaRecorded {
        tier: String,
        amount: u64,
        used: u64,
    },
    QuotaReset {
        tier: String,
    },
    WipLimitChanged {
        from: usize,
        to: usize,
        mode: String,
    },
    /// The overnight window closed with items still Active; they were
    /// failed and requeued for the next cycle.
    WindowClosed {
        requeued: Vec<WorkId>,
    },
    /// Unrecognized event from a newer or corrupted log line.
    Unknown {
        raw: String,
    },
}
