//! Error types for shiftq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::Status,
        to: crate::model::Status,
    },

    #[error("capacity violation: {active} active items with wip_limit {wip_limit}")]
    Capacity { active: usize, wip_limit: usize },

    #[error("quota exceeded for tier {tier}: requested {requested} units, {usable} usable")]
    QuotaExceeded {
        tier: String,
        requested: u64,
        usable: u64,
    },

    #[error("state corruption: {0}; refusing to schedule until the state is repaired or reset")]
    StateCorruption(String),

    #[error("state lock not acquired after {waited_secs}s")]
    LockTimeout { waited_secs: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
