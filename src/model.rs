//! Core data model.
//!
//! A work item is something that needs doing. It has identity, an opaque
//! description, priority, dependencies on other items, a timing class, and
//! a lifecycle status. The coordinator never interprets the description;
//! it only manages admission, ordering, and lifecycle.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier. Never reused, even across terminal statuses.
    pub id: WorkId,

    /// What the work is. Opaque to the coordinator; the classifier reads it.
    pub description: String,

    /// Priority 1..=10. Higher = more urgent.
    pub priority: u8,

    /// Complexity estimate 1..=10. Informational only.
    pub complexity: u8,

    /// Items that must be Completed before this one may go Active.
    pub dependencies: BTreeSet<WorkId>,

    /// Current lifecycle status.
    pub status: Status,

    /// When this work may run: now, overnight, or either.
    pub timing: Timing,

    /// Budget tier this item draws from.
    pub tier: String,

    /// Estimated budget units consumed by one execution.
    pub estimated_quota: u32,

    /// Estimated wall-clock minutes for one execution.
    pub estimated_minutes: u32,

    /// Number of failures so far. Monotonically non-decreasing.
    pub retry_count: u32,

    /// Last failure reason, kept for operator review.
    pub failure_reason: Option<String>,

    /// Identity of the worker the item was handed to, if any.
    pub agent: Option<String>,

    /// Where the result artifact landed, once completed.
    pub result_location: Option<PathBuf>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the item last entered Queued. Requeued items rejoin the tail
    /// of their priority class; fresh items keep created_at here.
    pub queued_at: DateTime<Utc>,
    /// Set when the item goes Active.
    pub started_at: Option<DateTime<Utc>>,
    /// Earliest time a deferred item should be considered for admission.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Is this item parked for the deferred (overnight) path?
    ///
    /// Async items always run deferred; Flexible items only once the
    /// admission decision has stamped a `scheduled_for` on them.
    pub fn is_deferred(&self) -> bool {
        match self.timing {
            Timing::Async => true,
            Timing::Flexible => self.scheduled_for.is_some(),
            Timing::Sync => false,
        }
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for dependencies and an admission slot.
    Queued,
    /// Admitted; a worker is (believed to be) executing it.
    Active,
    /// Done successfully. Terminal.
    Completed,
    /// Execution failed; settles to Queued (retry) or PermanentlyFailed.
    Failed,
    /// Retry budget exhausted. Terminal, surfaced for operator review.
    PermanentlyFailed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Queued, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Failed, Queued)            // retry
                | (Failed, PermanentlyFailed) // exhausted retries
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::PermanentlyFailed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Active => "active",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::PermanentlyFailed => "permanently_failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "active" => Ok(Status::Active),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "permanently_failed" | "permanently-failed" => Ok(Status::PermanentlyFailed),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// When a work item may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    /// Needs a human nearby; runs on the interactive path.
    Sync,
    /// Batchable; runs in the deferred execution window.
    Async,
    /// No inherent requirement; resolved at admission time.
    Flexible,
}

impl std::fmt::Display for Timing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Timing::Sync => "sync",
            Timing::Async => "async",
            Timing::Flexible => "flexible",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Timing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Timing::Sync),
            "async" => Ok(Timing::Async),
            "flexible" => Ok(Timing::Flexible),
            _ => Err(format!("unknown timing: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one execution, reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Arbitrary result data. Opaque to the coordinator.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Error message if failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Execution duration.
    #[serde(default)]
    pub duration_ms: u64,
    /// Budget units actually consumed, when the worker can tell.
    /// Falls back to the item's estimate otherwise.
    #[serde(default)]
    pub quota_used: Option<u32>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new work items. The coordinator's public API for adding work.
pub struct NewWorkItem {
    pub(crate) description: String,
    pub(crate) priority: u8,
    pub(crate) complexity: u8,
    pub(crate) dependencies: BTreeSet<WorkId>,
    pub(crate) tier: Option<String>,
    pub(crate) estimated_quota: u32,
    pub(crate) estimated_minutes: u32,
    /// Explicit timing override. None means the classifier decides.
    pub(crate) timing: Option<Timing>,
}

impl NewWorkItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: 5,
            complexity: 5,
            dependencies: BTreeSet::new(),
            tier: None,
            estimated_quota: 1,
            estimated_minutes: 30,
            timing: None,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn depends_on(mut self, id: WorkId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn estimated_quota(mut self, units: u32) -> Self {
        self.estimated_quota = units;
        self
    }

    pub fn estimated_minutes(mut self, minutes: u32) -> Self {
        self.estimated_minutes = minutes;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = Some(timing);
        self
    }
}
