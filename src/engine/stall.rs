//! Stall detection: Active items that have outlived the liveness threshold.
//!
//! Advisory only. A stalled item stays Active until the operator completes
//! or fails it; the coordinator has no visibility into the worker beyond
//! elapsed time, and no mid-execution cancellation primitive.

use chrono::{DateTime, Duration, Utc};

use crate::ledger::Ledger;
use crate::model::{Status, WorkId};

/// One stalled item, reported for operator decision.
#[derive(Debug, Clone)]
pub struct StallReport {
    pub id: WorkId,
    pub description: String,
    pub agent: Option<String>,
    pub active_for: Duration,
}

/// All Active items that have been running longer than `threshold`,
/// longest-running first.
pub fn find_stalled(ledger: &Ledger, threshold: Duration, now: DateTime<Utc>) -> Vec<StallReport> {
    let mut reports: Vec<StallReport> = ledger
        .by_status(Status::Active)
        .filter_map(|item| {
            let started = item.started_at?;
            let active_for = now - started;
            (active_for > threshold).then(|| StallReport {
                id: item.id,
                description: item.description.clone(),
                agent: item.agent.clone(),
                active_for,
            })
        })
        .collect();
    reports.sort_by_key(|r| std::cmp::Reverse(r.active_for));
    reports
}
