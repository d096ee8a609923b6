//! Integration tests for the coordinator engine.

use shiftq::config::Config;
use shiftq::engine::Engine;
use shiftq::error::Error;
use shiftq::model::{NewWorkItem, Status, Timing};

fn test_engine(wip: usize) -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = Config {
        state_dir: dir.path().to_path_buf(),
        initial_wip: wip,
        ..Config::default()
    };
    let engine = Engine::open(config).expect("failed to open engine");
    (dir, engine)
}

// ---------------------------------------------------------------------------
// Basic lifecycle: add -> schedule -> complete
// ---------------------------------------------------------------------------

#[test]
fn add_creates_queued_item() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(
            NewWorkItem::new("review the launch checklist")
                .priority(7)
                .complexity(4),
        )
        .unwrap();

    assert_eq!(item.status, Status::Queued);
    assert_eq!(item.priority, 7);
    assert_eq!(item.complexity, 4);
    assert_eq!(item.retry_count, 0);
    // "review" is a judgment signal
    assert_eq!(item.timing, Timing::Sync);
    assert!(item.scheduled_for.is_none());
}

#[test]
fn full_lifecycle_add_schedule_complete() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(NewWorkItem::new("one task").timing(Timing::Sync))
        .unwrap();

    let admitted = engine.schedule_next().unwrap();
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].id, item.id);
    assert_eq!(admitted[0].status, Status::Active);
    assert!(admitted[0].started_at.is_some());

    let completed = engine.complete_work(item.id).unwrap();
    assert_eq!(completed.status, Status::Completed);
    assert!(completed.completed_at.is_some());
}

#[test]
fn schedule_with_empty_queue_admits_nothing() {
    let (_dir, engine) = test_engine(3);
    assert!(engine.schedule_next().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn rejects_priority_out_of_range() {
    let (_dir, engine) = test_engine(3);

    for priority in [0u8, 11] {
        let result = engine.add_work(
            NewWorkItem::new("bad priority")
                .priority(priority)
                .timing(Timing::Sync),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    // State unchanged after rejections
    assert!(engine.list(None).unwrap().is_empty());
}

#[test]
fn rejects_unknown_dependency() {
    let (_dir, engine) = test_engine(3);

    let ghost = shiftq::model::WorkId::new();
    let result = engine.add_work(
        NewWorkItem::new("depends on nothing real")
            .depends_on(ghost)
            .timing(Timing::Sync),
    );
    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(engine.list(None).unwrap().is_empty());
}

#[test]
fn rejects_unknown_tier() {
    let (_dir, engine) = test_engine(3);

    let result = engine.add_work(
        NewWorkItem::new("charged to a phantom tier")
            .tier("phantom")
            .timing(Timing::Sync),
    );
    assert!(matches!(result, Err(Error::Validation(_))));
}

// ---------------------------------------------------------------------------
// Priority + dependency scheduling
// ---------------------------------------------------------------------------

#[test]
fn dependency_aware_priority_scheduling() {
    let (_dir, engine) = test_engine(2);

    let w1 = engine
        .add_work(NewWorkItem::new("w1").priority(8).timing(Timing::Sync))
        .unwrap();
    let w2 = engine
        .add_work(NewWorkItem::new("w2").priority(5).timing(Timing::Sync))
        .unwrap();
    let w3 = engine
        .add_work(
            NewWorkItem::new("w3")
                .priority(9)
                .depends_on(w1.id)
                .timing(Timing::Sync),
        )
        .unwrap();

    // w3 is ineligible; w1 outscores w2 (priority 8 + unblock bonus 2)
    let admitted = engine.schedule_next().unwrap();
    let ids: Vec<_> = admitted.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![w1.id, w2.id]);
    assert_eq!(engine.get(w3.id).unwrap().status, Status::Queued);

    // A new priority-5 item to compete against w3 once it unblocks
    let w4 = engine
        .add_work(NewWorkItem::new("w4").priority(5).timing(Timing::Sync))
        .unwrap();

    // Completing w1 frees a slot and cascades admission: w3 (score 9)
    // beats w4 (score 5)
    engine.complete_work(w1.id).unwrap();
    assert_eq!(engine.get(w3.id).unwrap().status, Status::Active);
    assert_eq!(engine.get(w4.id).unwrap().status, Status::Queued);
}

#[test]
fn dependency_gating_holds_with_free_slots() {
    let (_dir, engine) = test_engine(4);

    let base = engine
        .add_work(NewWorkItem::new("base").timing(Timing::Sync))
        .unwrap();
    let blocked = engine
        .add_work(
            NewWorkItem::new("blocked")
                .depends_on(base.id)
                .timing(Timing::Sync),
        )
        .unwrap();

    engine.schedule_next().unwrap();
    assert_eq!(engine.get(base.id).unwrap().status, Status::Active);
    // Slots remain, but the dependency is not Completed yet
    assert_eq!(engine.get(blocked.id).unwrap().status, Status::Queued);
}

#[test]
fn active_count_never_exceeds_wip_limit() {
    let (_dir, engine) = test_engine(2);

    for i in 0..5 {
        engine
            .add_work(NewWorkItem::new(format!("task {i}")).timing(Timing::Sync))
            .unwrap();
    }
    engine.schedule_next().unwrap();
    assert_eq!(engine.list(Some(Status::Active)).unwrap().len(), 2);

    // Completion frees one slot and admits exactly one more
    let active = engine.list(Some(Status::Active)).unwrap();
    engine.complete_work(active[0].id).unwrap();
    assert_eq!(engine.list(Some(Status::Active)).unwrap().len(), 2);

    // Repeated schedule calls are no-ops at the limit
    assert!(engine.schedule_next().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Idempotence and invalid transitions
// ---------------------------------------------------------------------------

#[test]
fn complete_work_is_idempotent() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(NewWorkItem::new("idempotent").timing(Timing::Sync))
        .unwrap();
    engine.schedule_next().unwrap();

    let first = engine.complete_work(item.id).unwrap();
    let second = engine.complete_work(item.id).unwrap();
    assert_eq!(first.status, Status::Completed);
    assert_eq!(second.status, Status::Completed);
    assert_eq!(first.completed_at, second.completed_at);
}

#[test]
fn completing_queued_item_errors() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(NewWorkItem::new("not started").timing(Timing::Sync))
        .unwrap();
    let result = engine.complete_work(item.id);
    assert!(matches!(result, Err(Error::InvalidTransition { .. })));
}

// ---------------------------------------------------------------------------
// Failure and retry
// ---------------------------------------------------------------------------

#[test]
fn retries_then_permanent_failure() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(NewWorkItem::new("flaky").timing(Timing::Sync))
        .unwrap();

    for attempt in 1..=2u32 {
        engine.schedule_next().unwrap();
        assert_eq!(engine.get(item.id).unwrap().status, Status::Active);
        let failed = engine.fail_work(item.id, "transient error").unwrap();
        assert_eq!(failed.status, Status::Queued);
        assert_eq!(failed.retry_count, attempt);
    }

    // Third failure exhausts the retry budget
    engine.schedule_next().unwrap();
    let failed = engine.fail_work(item.id, "still broken").unwrap();
    assert_eq!(failed.status, Status::PermanentlyFailed);
    assert_eq!(failed.retry_count, 3);

    // Never admitted again
    assert!(engine.schedule_next().unwrap().is_empty());
    assert_eq!(engine.get(item.id).unwrap().status, Status::PermanentlyFailed);

    // And a further fail_work is an invalid transition, not a retry
    assert!(matches!(
        engine.fail_work(item.id, "poke"),
        Err(Error::InvalidTransition { .. })
    ));

    // Surfaced in the status report
    let summary = engine.status_summary().unwrap();
    assert_eq!(summary.permanently_failed, 1);
    assert_eq!(summary.permanent_failures[0].id, item.id);
    assert_eq!(summary.permanent_failures[0].reason, "still broken");
}

#[test]
fn failure_frees_slot_for_next_item() {
    let (_dir, engine) = test_engine(1);

    let a = engine
        .add_work(NewWorkItem::new("a").priority(9).timing(Timing::Sync))
        .unwrap();
    let b = engine
        .add_work(NewWorkItem::new("b").priority(1).timing(Timing::Sync))
        .unwrap();

    engine.schedule_next().unwrap();
    assert_eq!(engine.get(a.id).unwrap().status, Status::Active);

    // Failing a requeues it and cascades admission; a wins the slot back
    // on score, so b keeps waiting
    engine.fail_work(a.id, "boom").unwrap();
    assert_eq!(engine.get(a.id).unwrap().status, Status::Active);
    assert_eq!(engine.get(b.id).unwrap().status, Status::Queued);
}

// ---------------------------------------------------------------------------
// Classification integration
// ---------------------------------------------------------------------------

#[test]
fn async_work_is_parked_for_the_window() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(NewWorkItem::new("scan the archive for broken links"))
        .unwrap();
    assert_eq!(item.timing, Timing::Async);
    assert!(item.scheduled_for.is_some());

    // The interactive scheduler never touches deferred work
    assert!(engine.schedule_next().unwrap().is_empty());
    assert_eq!(engine.get(item.id).unwrap().status, Status::Queued);

    let summary = engine.status_summary().unwrap();
    assert_eq!(summary.deferred, 1);
}

#[test]
fn destructive_signal_forces_sync_path() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(NewWorkItem::new(
            "search for papers and then delete the old ones",
        ))
        .unwrap();
    assert_eq!(item.timing, Timing::Sync);
    assert!(item.scheduled_for.is_none());
    assert_eq!(engine.schedule_next().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn events_are_recorded_with_monotonic_seq() {
    let (_dir, engine) = test_engine(3);

    let item = engine
        .add_work(NewWorkItem::new("evented").timing(Timing::Sync))
        .unwrap();
    engine.schedule_next().unwrap();
    engine.complete_work(item.id).unwrap();

    let events = engine.events_since(0).unwrap();
    assert!(events.len() >= 3);
    for window in events.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }
}
