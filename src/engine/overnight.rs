//! Deferred (overnight) batch execution.
//!
//! Runs the same admission algorithm as the interactive scheduler, but
//! only over deferred items, only under the quota ledger, and only for a
//! hard-capped stretch of wall clock. Each item is admitted in one
//! transaction, executed with the lock released, and retired in another,
//! so interactive callers are never blocked behind a running worker.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use super::Engine;
use crate::error::Result;
use crate::event::EventKind;
use crate::model::{Status, WorkId, WorkItem};
use crate::worker::Worker;

/// What one overnight run did, for the next session's status report.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: Vec<WorkId>,
    /// Failed but requeued for a later cycle.
    pub requeued: Vec<WorkId>,
    pub permanently_failed: Vec<WorkId>,
    /// Skipped this cycle because admission would exceed usable budget.
    pub deferred_for_quota: Vec<WorkId>,
    /// Active leftovers from a crashed cycle, failed-and-requeued.
    pub swept: Vec<WorkId>,
    /// True when the wall-clock cap ended the run with work remaining.
    pub hit_cap: bool,
}

pub(crate) fn run(engine: &Engine, worker: &mut dyn Worker) -> Result<RunSummary> {
    let started = Instant::now();
    let cap = engine
        .config
        .window_cap()
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(3 * 3600));

    let mut summary = RunSummary::default();

    // Anything deferred still Active belongs to a cycle that never
    // retired it. Treat as stalled: fail and requeue for this run.
    summary.swept = sweep_abandoned(engine, "stalled: abandoned by previous window")?;

    // Items skipped for quota this run. Tracked here so each is deferred
    // (and its event emitted) once, not on every admission pass.
    let mut skipped: Vec<WorkId> = Vec::new();

    loop {
        if started.elapsed() >= cap {
            summary.hit_cap = true;
            break;
        }

        let Some(item) = admit_next_deferred(engine, &mut skipped)? else {
            break;
        };

        let work_dir = engine.store.work_dir(item.id);
        std::fs::create_dir_all(&work_dir)?;
        let outcome = worker.execute(&item, &work_dir);

        let now = Utc::now();
        let retired = engine.store.with_transaction(&engine.config, |ledger| {
            super::reset_quota(ledger, now);
            if outcome.success {
                let data = outcome
                    .data
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({}));
                let location = engine.store.write_result(item.id, &data)?;
                super::complete_in(ledger, item.id, now, Some(location))?;

                let amount =
                    u64::from(outcome.quota_used.unwrap_or(item.estimated_quota));
                let used = ledger.quota.record_usage(&item.tier, amount)?;
                ledger.emit(
                    EventKind::QuotaRecorded {
                        tier: item.tier.clone(),
                        amount,
                        used,
                    },
                    now,
                );
                Ok(Status::Completed)
            } else {
                let reason = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".to_string());
                super::fail_in(ledger, &engine.config, item.id, &reason, now, true)
            }
        })?;

        match retired {
            Status::Completed => summary.completed.push(item.id),
            Status::PermanentlyFailed => summary.permanently_failed.push(item.id),
            _ => summary.requeued.push(item.id),
        }
    }

    summary.deferred_for_quota = skipped;

    // The window is over; anything still Active on the deferred path is
    // stalled by definition and goes back in the queue for next cycle.
    let requeued_at_close = sweep_abandoned(engine, "stalled: window closed")?;
    if !requeued_at_close.is_empty() {
        let now = Utc::now();
        engine.store.with_transaction(&engine.config, |ledger| {
            ledger.emit(
                EventKind::WindowClosed {
                    requeued: requeued_at_close.clone(),
                },
                now,
            );
            Ok(())
        })?;
        summary.swept.extend(requeued_at_close);
    }

    info!(
        completed = summary.completed.len(),
        requeued = summary.requeued.len(),
        permanently_failed = summary.permanently_failed.len(),
        deferred_for_quota = summary.deferred_for_quota.len(),
        hit_cap = summary.hit_cap,
        "overnight run finished"
    );
    Ok(summary)
}

/// Admit the best deferred candidate that fits its tier's usable budget.
/// Candidates that do not fit are skipped (they stay Queued) with an
/// audit event, once per run.
fn admit_next_deferred(engine: &Engine, skipped: &mut Vec<WorkId>) -> Result<Option<WorkItem>> {
    let now = Utc::now();
    engine.store.with_transaction(&engine.config, |ledger| {
        super::reset_quota(ledger, now);

        loop {
            if ledger.active_count() >= ledger.wip_limit {
                return Ok(None);
            }

            let candidate = super::best_candidate(ledger, &engine.config, |item| {
                item.is_deferred()
                    && !skipped.contains(&item.id)
                    && item.scheduled_for.is_none_or(|at| at <= now)
            });
            let Some(id) = candidate else {
                return Ok(None);
            };

            let item = ledger.get(id)?.clone();
            let requested = u64::from(item.estimated_quota);
            if ledger.quota.would_exceed(&item.tier, requested) {
                let usable = ledger.quota.usable(&item.tier).unwrap_or(0);
                warn!(
                    id = %id,
                    tier = %item.tier,
                    requested,
                    usable,
                    "admission deferred for quota"
                );
                ledger.emit(
                    EventKind::WorkDeferred {
                        id,
                        tier: item.tier.clone(),
                        requested,
                        usable,
                    },
                    now,
                );
                skipped.push(id);
                continue;
            }

            super::admit(ledger, &engine.config, id, now, Some("overnight"))?;
            return ledger.get(id).cloned().map(Some);
        }
    })
}

/// Fail-and-requeue every Active item on the deferred path.
fn sweep_abandoned(engine: &Engine, reason: &str) -> Result<Vec<WorkId>> {
    let now = Utc::now();
    engine.store.with_transaction(&engine.config, |ledger| {
        let abandoned: Vec<WorkId> = ledger
            .by_status(Status::Active)
            .filter(|item| item.is_deferred())
            .map(|item| item.id)
            .collect();
        for id in &abandoned {
            super::fail_in(ledger, &engine.config, *id, reason, now, true)?;
        }
        Ok(abandoned)
    })
}
