//! The persisted ledger: single source of truth for all work state.
//!
//! One record holds every work item ever added (terminal items included,
//! as audit history), the current WIP limit, and the quota ledger. The
//! store serializes the whole record atomically; this module owns the
//! in-memory queries and insertion validation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{Status, WorkId, WorkItem};
use crate::quota::QuotaLedger;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    /// Maximum items permitted Active simultaneously.
    pub wip_limit: usize,

    /// Every work item ever added, keyed by id. Never removed.
    pub items: BTreeMap<WorkId, WorkItem>,

    /// Per-tier renewable budget state.
    pub quota: QuotaLedger,

    /// Sequence number the next audit event will carry.
    pub next_event_seq: u64,

    /// Events emitted during the current transaction, drained by the
    /// store after a successful save.
    #[serde(skip)]
    pending_events: Vec<Event>,
}

impl Ledger {
    pub fn new(config: &Config, now: DateTime<Utc>) -> Self {
        Self {
            wip_limit: config.initial_wip,
            items: BTreeMap::new(),
            quota: QuotaLedger::from_config(&config.tiers, now),
            next_event_seq: 0,
            pending_events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Record an audit event for the current transaction.
    pub fn emit(&mut self, kind: EventKind, now: DateTime<Utc>) {
        let event = Event {
            seq: self.next_event_seq,
            timestamp: now,
            kind,
        };
        self.next_event_seq += 1;
        self.pending_events.push(event);
    }

    /// Drain the events emitted during this transaction.
    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: WorkId) -> Result<&WorkItem> {
        self.items
            .get(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: WorkId) -> Result<&mut WorkItem> {
        self.items
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn by_status(&self, status: Status) -> impl Iterator<Item = &WorkItem> {
        self.items.values().filter(move |i| i.status == status)
    }

    pub fn count(&self, status: Status) -> usize {
        self.by_status(status).count()
    }

    pub fn active_count(&self) -> usize {
        self.count(Status::Active)
    }

    /// A Queued item is eligible once every dependency is Completed.
    pub fn is_eligible(&self, item: &WorkItem) -> bool {
        item.status == Status::Queued
            && item.dependencies.iter().all(|dep| {
                self.items
                    .get(dep)
                    .is_some_and(|d| d.status == Status::Completed)
            })
    }

    /// How many currently Queued items list `id` as a dependency.
    pub fn unblock_count(&self, id: WorkId) -> u32 {
        self.by_status(Status::Queued)
            .filter(|i| i.dependencies.contains(&id))
            .count() as u32
    }

    /// Admission score: priority plus a bonus for work that frees future
    /// work. Ties are broken by earliest created_at at the call sites.
    pub fn score(&self, item: &WorkItem, unblock_weight: u32) -> u32 {
        u32::from(item.priority) + unblock_weight * self.unblock_count(item.id)
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    /// Validate and insert a new item as Queued. On any violation the
    /// ledger is left unchanged.
    pub fn insert(&mut self, item: WorkItem) -> Result<()> {
        self.validate_new(&item)?;
        self.items.insert(item.id, item);
        Ok(())
    }

    fn validate_new(&self, item: &WorkItem) -> Result<()> {
        if !(1..=10).contains(&item.priority) {
            return Err(Error::Validation(format!(
                "priority {} outside 1..=10",
                item.priority
            )));
        }
        if !(1..=10).contains(&item.complexity) {
            return Err(Error::Validation(format!(
                "complexity {} outside 1..=10",
                item.complexity
            )));
        }
        if self.items.contains_key(&item.id) {
            return Err(Error::Validation(format!(
                "id {} already exists; ids are never reused",
                item.id
            )));
        }
        if item.dependencies.contains(&item.id) {
            return Err(Error::Validation(format!(
                "item {} depends on itself",
                item.id
            )));
        }
        for dep in &item.dependencies {
            if !self.items.contains_key(dep) {
                return Err(Error::Validation(format!(
                    "unknown dependency {dep}: dependencies must reference existing items"
                )));
            }
        }
        if self.would_cycle(item) {
            return Err(Error::Validation(format!(
                "dependency cycle through item {}",
                item.id
            )));
        }
        Ok(())
    }

    /// Walk the dependency graph from the new item's dependencies looking
    /// for a path back to the new item. A fresh id cannot appear in the
    /// existing graph, so this also guards against a hand-edited state
    /// file that smuggled the id in ahead of insertion.
    fn would_cycle(&self, item: &WorkItem) -> bool {
        let mut stack: Vec<WorkId> = item.dependencies.iter().copied().collect();
        let mut visited = std::collections::BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == item.id {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(dep) = self.items.get(&id) {
                stack.extend(dep.dependencies.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::model::NewWorkItem;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    fn ledger() -> Ledger {
        Ledger::new(&Config::default(), now())
    }

    fn item(new: NewWorkItem) -> WorkItem {
        WorkItem {
            id: WorkId::new(),
            description: new.description,
            priority: new.priority,
            complexity: new.complexity,
            dependencies: new.dependencies,
            status: Status::Queued,
            timing: crate::model::Timing::Sync,
            tier: "standard".to_string(),
            estimated_quota: new.estimated_quota,
            estimated_minutes: new.estimated_minutes,
            retry_count: 0,
            failure_reason: None,
            agent: None,
            result_location: None,
            created_at: now(),
            updated_at: now(),
            queued_at: now(),
            started_at: None,
            scheduled_for: None,
            completed_at: None,
        }
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let mut ledger = ledger();
        let bad = item(NewWorkItem::new("p0").priority(0));
        assert!(matches!(ledger.insert(bad), Err(Error::Validation(_))));
        let bad = item(NewWorkItem::new("p11").priority(11));
        assert!(matches!(ledger.insert(bad), Err(Error::Validation(_))));
        assert!(ledger.items.is_empty());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut ledger = ledger();
        let ghost = WorkId::new();
        let bad = item(NewWorkItem::new("depends on ghost").depends_on(ghost));
        assert!(matches!(ledger.insert(bad), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_self_dependency() {
        let mut ledger = ledger();
        let mut bad = item(NewWorkItem::new("narcissist"));
        bad.dependencies.insert(bad.id);
        assert!(matches!(ledger.insert(bad), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_id_reuse() {
        let mut ledger = ledger();
        let first = item(NewWorkItem::new("first"));
        let id = first.id;
        ledger.insert(first).unwrap();
        let mut dup = item(NewWorkItem::new("imposter"));
        dup.id = id;
        assert!(matches!(ledger.insert(dup), Err(Error::Validation(_))));
    }

    #[test]
    fn unblock_count_counts_queued_dependents() {
        let mut ledger = ledger();
        let base = item(NewWorkItem::new("base"));
        let base_id = base.id;
        ledger.insert(base).unwrap();
        ledger
            .insert(item(NewWorkItem::new("dependent a").depends_on(base_id)))
            .unwrap();
        ledger
            .insert(item(NewWorkItem::new("dependent b").depends_on(base_id)))
            .unwrap();

        assert_eq!(ledger.unblock_count(base_id), 2);

        // Score: priority 5 + 2 * 2 unblocks = 9
        let base = ledger.get(base_id).unwrap().clone();
        assert_eq!(ledger.score(&base, 2), 9);
    }

    #[test]
    fn eligibility_requires_completed_dependencies() {
        let mut ledger = ledger();
        let base = item(NewWorkItem::new("base"));
        let base_id = base.id;
        ledger.insert(base).unwrap();
        let blocked = item(NewWorkItem::new("blocked").depends_on(base_id));
        let blocked_id = blocked.id;
        ledger.insert(blocked).unwrap();

        let blocked = ledger.get(blocked_id).unwrap().clone();
        assert!(!ledger.is_eligible(&blocked));

        ledger.get_mut(base_id).unwrap().status = Status::Completed;
        assert!(ledger.is_eligible(&blocked));
    }
}
