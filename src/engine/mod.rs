//! Core engine. The public operations surface for the coordinator.
//!
//! The engine owns the store and the config; every state transition goes
//! through here, one locked transaction per operation. The scheduler is a
//! synchronous decision function invoked on each state-changing event,
//! never a background loop: completing or failing work immediately
//! re-runs admission so a freed slot never sits idle.

pub mod control;
pub mod overnight;
pub mod stall;

pub use control::{Mode, WipRecommendation};
pub use overnight::RunSummary;
pub use stall::StallReport;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::classify::{self, Placement};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::ledger::Ledger;
use crate::model::{NewWorkItem, Status, Timing, WorkId, WorkItem};
use crate::quota::Forecast;
use crate::store::Store;
use crate::worker::Worker;

/// The coordinator engine. Owns all state and enforces all invariants.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) config: Config,
}

impl Engine {
    /// Open an engine over the configured state directory.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Store::open(&config.state_dir)?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Operations surface
    // -----------------------------------------------------------------------

    /// Add new work. Validates, classifies, and queues it; deferred items
    /// get stamped with the next execution window.
    pub fn add_work(&self, new: NewWorkItem) -> Result<WorkItem> {
        let now = Utc::now();
        self.store.with_transaction(&self.config, |ledger| {
            add_work_in(ledger, &self.config, new, now)
        })
    }

    /// Admit eligible work until the WIP limit or eligibility runs out.
    /// Returns the items admitted by this call.
    pub fn schedule_next(&self) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        self.store.with_transaction(&self.config, |ledger| {
            reset_quota(ledger, now);
            let admitted = admit_ready(ledger, &self.config, now, None)?;
            Ok(admitted
                .into_iter()
                .filter_map(|id| ledger.items.get(&id).cloned())
                .collect())
        })
    }

    /// Mark work completed. Idempotent: completing a Completed item is a
    /// no-op. Frees a slot and immediately re-runs admission.
    pub fn complete_work(&self, id: WorkId) -> Result<WorkItem> {
        let now = Utc::now();
        self.store.with_transaction(&self.config, |ledger| {
            reset_quota(ledger, now);
            complete_in(ledger, id, now, None)?;
            admit_ready(ledger, &self.config, now, None)?;
            ledger.get(id).cloned()
        })
    }

    /// Report a worker failure. Retries until the retry budget runs out,
    /// then parks the item as permanently failed for operator review.
    pub fn fail_work(&self, id: WorkId, reason: impl Into<String>) -> Result<WorkItem> {
        let now = Utc::now();
        let reason = reason.into();
        self.store.with_transaction(&self.config, |ledger| {
            reset_quota(ledger, now);
            fail_in(ledger, &self.config, id, &reason, now, false)?;
            // Snapshot before the cascade: the freed slot may re-admit
            // this very item if it still outscores the field.
            let snapshot = ledger.get(id).cloned()?;
            admit_ready(ledger, &self.config, now, None)?;
            Ok(snapshot)
        })
    }

    /// Advisory stall reports for Active items past the threshold.
    pub fn find_stalled(&self) -> Result<Vec<StallReport>> {
        let now = Utc::now();
        self.store.read(&self.config, |ledger| {
            Ok(stall::find_stalled(
                ledger,
                self.config.stall_threshold(),
                now,
            ))
        })
    }

    /// Recompute the WIP limit from trailing metrics and apply it.
    /// Never preempts Active items; a raised limit admits eligible work
    /// immediately.
    pub fn retune(&self) -> Result<WipRecommendation> {
        let now = Utc::now();
        self.store.with_transaction(&self.config, |ledger| {
            let rec = control::recommend(ledger, &self.config, now);
            if rec.wip_limit != ledger.wip_limit {
                info!(
                    from = ledger.wip_limit,
                    to = rec.wip_limit,
                    mode = %rec.mode,
                    "wip limit retuned"
                );
                ledger.emit(
                    EventKind::WipLimitChanged {
                        from: ledger.wip_limit,
                        to: rec.wip_limit,
                        mode: rec.mode.to_string(),
                    },
                    now,
                );
                ledger.wip_limit = rec.wip_limit;
                admit_ready(ledger, &self.config, now, None)?;
            }
            Ok(rec)
        })
    }

    /// Record consumed budget units against a tier.
    pub fn record_usage(&self, tier: &str, amount: u64) -> Result<u64> {
        let now = Utc::now();
        self.store.with_transaction(&self.config, |ledger| {
            reset_quota(ledger, now);
            let used = ledger.quota.record_usage(tier, amount)?;
            ledger.emit(
                EventKind::QuotaRecorded {
                    tier: tier.to_string(),
                    amount,
                    used,
                },
                now,
            );
            Ok(used)
        })
    }

    /// Full picture for the operator: counts, stalls, permanent failures,
    /// budget state, and what the controller would do next.
    pub fn status_summary(&self) -> Result<StatusSummary> {
        let now = Utc::now();
        self.store.read(&self.config, |ledger| {
            let stalled = stall::find_stalled(ledger, self.config.stall_threshold(), now);
            let permanent_failures = ledger
                .by_status(Status::PermanentlyFailed)
                .map(|item| PermanentFailure {
                    id: item.id,
                    description: item.description.clone(),
                    reason: item
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    retry_count: item.retry_count,
                })
                .collect();
            let tiers = ledger
                .quota
                .tiers
                .iter()
                .map(|(name, tier)| TierStatus {
                    name: name.clone(),
                    limit: tier.limit,
                    used: tier.used,
                    usable: tier.usable(),
                    resets_at: tier.resets_at,
                })
                .collect();

            Ok(StatusSummary {
                wip_limit: ledger.wip_limit,
                queued: ledger.count(Status::Queued),
                deferred: ledger
                    .by_status(Status::Queued)
                    .filter(|i| i.is_deferred())
                    .count(),
                active: ledger.active_count(),
                completed: ledger.count(Status::Completed),
                permanently_failed: ledger.count(Status::PermanentlyFailed),
                stalled,
                permanent_failures,
                recommendation: control::recommend(ledger, &self.config, now),
                tiers,
            })
        })
    }

    /// Budget dry run over the pending deferred batch, highest score
    /// first: what fits tonight, what must wait for the next renewal.
    pub fn forecast(&self) -> Result<Forecast> {
        self.store.read(&self.config, |ledger| {
            let mut pending: Vec<&WorkItem> = ledger
                .by_status(Status::Queued)
                .filter(|i| i.is_deferred())
                .collect();
            pending.sort_by(|a, b| {
                let sa = ledger.score(a, self.config.unblock_weight);
                let sb = ledger.score(b, self.config.unblock_weight);
                sb.cmp(&sa).then(a.queued_at.cmp(&b.queued_at))
            });
            Ok(ledger.quota.forecast(pending))
        })
    }

    /// Run the deferred batch inside the execution window.
    pub fn run_overnight(&self, worker: &mut dyn Worker) -> Result<RunSummary> {
        overnight::run(self, worker)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn get(&self, id: WorkId) -> Result<WorkItem> {
        self.store
            .read(&self.config, |ledger| ledger.get(id).cloned())
    }

    /// List items, optionally filtered by status, highest priority first.
    pub fn list(&self, status: Option<Status>) -> Result<Vec<WorkItem>> {
        self.store.read(&self.config, |ledger| {
            let mut items: Vec<WorkItem> = ledger
                .items
                .values()
                .filter(|i| status.is_none_or(|s| i.status == s))
                .cloned()
                .collect();
            items.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });
            Ok(items)
        })
    }

    /// Audit events after a sequence number.
    pub fn events_since(&self, seq: u64) -> Result<Vec<Event>> {
        self.store.read_events_since(seq)
    }
}

// ---------------------------------------------------------------------------
// Operator-facing reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub wip_limit: usize,
    pub queued: usize,
    /// Queued items parked for the deferred path (subset of `queued`).
    pub deferred: usize,
    pub active: usize,
    pub completed: usize,
    pub permanently_failed: usize,
    pub stalled: Vec<StallReport>,
    pub permanent_failures: Vec<PermanentFailure>,
    pub recommendation: WipRecommendation,
    pub tiers: Vec<TierStatus>,
}

#[derive(Debug, Clone)]
pub struct PermanentFailure {
    pub id: WorkId,
    pub description: String,
    pub reason: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub struct TierStatus {
    pub name: String,
    pub limit: u64,
    pub used: u64,
    pub usable: u64,
    pub resets_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transaction bodies, shared with the overnight runner
// ---------------------------------------------------------------------------

/// Roll quota tiers past their renewal boundary, with audit events.
pub(crate) fn reset_quota(ledger: &mut Ledger, now: DateTime<Utc>) {
    for tier in ledger.quota.maybe_reset(now) {
        info!(tier = %tier, "quota tier reset");
        ledger.emit(EventKind::QuotaReset { tier }, now);
    }
}

pub(crate) fn add_work_in(
    ledger: &mut Ledger,
    config: &Config,
    new: NewWorkItem,
    now: DateTime<Utc>,
) -> Result<WorkItem> {
    reset_quota(ledger, now);

    let tier = new.tier.unwrap_or_else(|| config.default_tier.clone());
    if !ledger.quota.tiers.contains_key(&tier) {
        return Err(Error::Validation(format!(
            "unknown tier {tier}: configure it before adding work against it"
        )));
    }

    let timing = new
        .timing
        .unwrap_or_else(|| classify::classify(&new.description));

    let scheduled_for = match timing {
        Timing::Sync => None,
        Timing::Async => Some(config.next_window_open(now)),
        Timing::Flexible => {
            let headroom = !ledger
                .quota
                .would_exceed(&tier, u64::from(new.estimated_quota));
            match classify::resolve_flexible(config, now, headroom) {
                Placement::Immediate => None,
                Placement::Deferred => Some(config.next_window_open(now)),
            }
        }
    };

    let item = WorkItem {
        id: WorkId::new(),
        description: new.description,
        priority: new.priority,
        complexity: new.complexity,
        dependencies: new.dependencies,
        status: Status::Queued,
        timing,
        tier: tier.clone(),
        estimated_quota: new.estimated_quota,
        estimated_minutes: new.estimated_minutes,
        retry_count: 0,
        failure_reason: None,
        agent: None,
        result_location: None,
        created_at: now,
        updated_at: now,
        queued_at: now,
        started_at: None,
        scheduled_for,
        completed_at: None,
    };

    ledger.insert(item.clone())?;
    info!(id = %item.id, priority = item.priority, timing = %timing, "work added");
    ledger.emit(
        EventKind::WorkAdded {
            id: item.id,
            priority: item.priority,
            timing,
            tier,
        },
        now,
    );
    Ok(item)
}

/// Admit immediate-path work until no slot or no eligible item remains.
pub(crate) fn admit_ready(
    ledger: &mut Ledger,
    config: &Config,
    now: DateTime<Utc>,
    agent: Option<&str>,
) -> Result<Vec<WorkId>> {
    let mut admitted = Vec::new();
    loop {
        if ledger.active_count() >= ledger.wip_limit {
            break;
        }
        let Some(id) = best_candidate(ledger, config, |item| !item.is_deferred()) else {
            break;
        };
        admit(ledger, config, id, now, agent)?;
        admitted.push(id);
    }
    Ok(admitted)
}

/// The highest-scoring eligible Queued item passing `filter`, ties broken
/// by earliest queue entry (FIFO fairness; requeued items wait their turn).
pub(crate) fn best_candidate(
    ledger: &Ledger,
    config: &Config,
    filter: impl Fn(&WorkItem) -> bool,
) -> Option<WorkId> {
    let mut best: Option<(u32, DateTime<Utc>, WorkId)> = None;
    for item in ledger.by_status(Status::Queued) {
        if !filter(item) || !ledger.is_eligible(item) {
            continue;
        }
        let score = ledger.score(item, config.unblock_weight);
        let better = match &best {
            None => true,
            Some((bs, bq, _)) => score > *bs || (score == *bs && item.queued_at < *bq),
        };
        if better {
            best = Some((score, item.queued_at, item.id));
        }
    }
    best.map(|(_, _, id)| id)
}

/// Transition one Queued item to Active. Admitting past the WIP limit is
/// an invariant breach, not a recoverable condition.
pub(crate) fn admit(
    ledger: &mut Ledger,
    config: &Config,
    id: WorkId,
    now: DateTime<Utc>,
    agent: Option<&str>,
) -> Result<()> {
    let active = ledger.active_count();
    if active >= ledger.wip_limit {
        return Err(Error::Capacity {
            active,
            wip_limit: ledger.wip_limit,
        });
    }

    let score = {
        let item = ledger.get(id)?;
        if !item.status.can_transition_to(Status::Active) {
            return Err(Error::InvalidTransition {
                from: item.status,
                to: Status::Active,
            });
        }
        ledger.score(item, config.unblock_weight)
    };

    let item = ledger.get_mut(id)?;
    item.status = Status::Active;
    item.started_at = Some(now);
    item.updated_at = now;
    item.agent = agent.map(str::to_string);
    info!(id = %id, score, agent = agent.unwrap_or("-"), "work admitted");
    ledger.emit(
        EventKind::WorkAdmitted {
            id,
            score,
            agent: agent.map(str::to_string),
        },
        now,
    );
    Ok(())
}

/// Mark an item Completed. Returns false for the idempotent no-op case.
pub(crate) fn complete_in(
    ledger: &mut Ledger,
    id: WorkId,
    now: DateTime<Utc>,
    result_location: Option<std::path::PathBuf>,
) -> Result<bool> {
    let item = ledger.get(id)?;
    if item.status == Status::Completed {
        return Ok(false);
    }
    if !item.status.can_transition_to(Status::Completed) {
        return Err(Error::InvalidTransition {
            from: item.status,
            to: Status::Completed,
        });
    }

    let item = ledger.get_mut(id)?;
    item.status = Status::Completed;
    item.completed_at = Some(now);
    item.updated_at = now;
    if result_location.is_some() {
        item.result_location = result_location.clone();
    }
    let result_location = item.result_location.clone();
    info!(id = %id, "work completed");
    ledger.emit(
        EventKind::WorkCompleted {
            id,
            result_location,
        },
        now,
    );
    Ok(true)
}

/// Record a failure: requeue below the retry budget, permanently fail at
/// it. With `backoff`, a requeued item's next consideration is pushed
/// into a future execution window.
pub(crate) fn fail_in(
    ledger: &mut Ledger,
    config: &Config,
    id: WorkId,
    reason: &str,
    now: DateTime<Utc>,
    backoff: bool,
) -> Result<Status> {
    {
        let item = ledger.get(id)?;
        if !item.status.can_transition_to(Status::Failed) {
            return Err(Error::InvalidTransition {
                from: item.status,
                to: Status::Failed,
            });
        }
    }

    let max_retries = config.max_retries;
    let item = ledger.get_mut(id)?;
    item.status = Status::Failed;
    item.retry_count += 1;
    item.failure_reason = Some(reason.to_string());
    item.updated_at = now;
    let retry_count = item.retry_count;

    ledger.emit(
        EventKind::WorkFailed {
            id,
            reason: reason.to_string(),
            retry_count,
        },
        now,
    );

    if retry_count >= max_retries {
        let item = ledger.get_mut(id)?;
        item.status = Status::PermanentlyFailed;
        warn!(id = %id, retry_count, reason, "work permanently failed");
        ledger.emit(
            EventKind::WorkPermanentlyFailed {
                id,
                reason: reason.to_string(),
                retry_count,
            },
            now,
        );
        Ok(Status::PermanentlyFailed)
    } else {
        let scheduled_for = backoff.then(|| config.clamp_into_window(now + backoff_delay(config, retry_count)));
        let item = ledger.get_mut(id)?;
        item.status = Status::Queued;
        item.queued_at = now;
        item.started_at = None;
        item.agent = None;
        if let Some(at) = scheduled_for {
            item.scheduled_for = Some(at);
        }
        let scheduled_for = item.scheduled_for;
        warn!(id = %id, retry_count, reason, "work failed, requeued");
        ledger.emit(EventKind::WorkRequeued { id, scheduled_for }, now);
        Ok(Status::Queued)
    }
}

/// Exponential backoff: base doubled per retry, capped.
fn backoff_delay(config: &Config, retry_count: u32) -> Duration {
    let shift = retry_count.saturating_sub(1).min(6);
    let minutes = config
        .retry_backoff_minutes
        .saturating_mul(1 << shift)
        .min(config.retry_backoff_cap_minutes);
    Duration::minutes(minutes)
}
