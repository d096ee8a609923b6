//! Integration tests for the deferred (overnight) runner.

use std::path::Path;

use chrono::{Duration, Utc};
use serde_json::json;
use shiftq::config::{Config, TierConfig};
use shiftq::engine::Engine;
use shiftq::model::{NewWorkItem, Outcome, Status, Timing, WorkId, WorkItem};
use shiftq::store::Store;
use shiftq::worker::Worker;

fn quota_config(dir: &Path, daily_limit: u64) -> Config {
    Config {
        state_dir: dir.to_path_buf(),
        default_tier: "sonnet".to_string(),
        tiers: vec![TierConfig {
            name: "sonnet".to_string(),
            daily_limit,
            reserve_fraction: 0.0,
        }],
        ..Config::default()
    }
}

/// Pull every deferred item's scheduled_for into the past so the runner
/// sees it as due, regardless of when the test executes.
fn backdate(dir: &Path, config: &Config) {
    let store = Store::open(dir).unwrap();
    store
        .with_transaction(config, |ledger| {
            let past = Utc::now() - Duration::minutes(5);
            for item in ledger.items.values_mut() {
                if item.scheduled_for.is_some() {
                    item.scheduled_for = Some(past);
                }
            }
            Ok(())
        })
        .unwrap();
}

/// Scripted worker: succeeds or fails everything, remembering what ran.
struct StubWorker {
    succeed: bool,
    calls: Vec<WorkId>,
}

impl StubWorker {
    fn succeeding() -> Self {
        Self {
            succeed: true,
            calls: Vec::new(),
        }
    }

    fn failing() -> Self {
        Self {
            succeed: false,
            calls: Vec::new(),
        }
    }
}

impl Worker for StubWorker {
    fn execute(&mut self, item: &WorkItem, _work_dir: &Path) -> Outcome {
        self.calls.push(item.id);
        Outcome {
            success: self.succeed,
            data: self.succeed.then(|| json!({"note": "done"})),
            error: (!self.succeed).then(|| "boom".to_string()),
            duration_ms: 1,
            quota_used: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Quota-gated admission
// ---------------------------------------------------------------------------

#[test]
fn quota_admits_one_defers_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let config = quota_config(dir.path(), 50);
    let engine = Engine::open(config.clone()).unwrap();

    let big = engine
        .add_work(
            NewWorkItem::new("nightly sweep a")
                .priority(8)
                .estimated_quota(30)
                .timing(Timing::Async),
        )
        .unwrap();
    let small = engine
        .add_work(
            NewWorkItem::new("nightly sweep b")
                .priority(5)
                .estimated_quota(30)
                .timing(Timing::Async),
        )
        .unwrap();
    backdate(dir.path(), &config);

    let mut worker = StubWorker::succeeding();
    let summary = engine.run_overnight(&mut worker).unwrap();

    // The higher-scoring item ran; the other did not fit 50 - 30 = 20
    assert_eq!(summary.completed, vec![big.id]);
    assert_eq!(summary.deferred_for_quota, vec![small.id]);
    assert_eq!(worker.calls, vec![big.id]);

    assert_eq!(engine.get(big.id).unwrap().status, Status::Completed);
    assert_eq!(engine.get(small.id).unwrap().status, Status::Queued);

    // Budget used never exceeded the usable 50
    let summary = engine.status_summary().unwrap();
    assert_eq!(summary.tiers[0].used, 30);
}

#[test]
fn completed_item_gets_result_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = quota_config(dir.path(), 0);
    let engine = Engine::open(config.clone()).unwrap();

    let item = engine
        .add_work(NewWorkItem::new("index the notes").timing(Timing::Async))
        .unwrap();
    backdate(dir.path(), &config);

    let mut worker = StubWorker::succeeding();
    engine.run_overnight(&mut worker).unwrap();

    let done = engine.get(item.id).unwrap();
    assert_eq!(done.status, Status::Completed);
    let location = done.result_location.expect("result location set");
    let raw = std::fs::read_to_string(location).unwrap();
    let data: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(data, json!({"note": "done"}));
}

// ---------------------------------------------------------------------------
// Retry with bounded backoff
// ---------------------------------------------------------------------------

#[test]
fn failure_requeues_with_backoff_into_a_window() {
    let dir = tempfile::tempdir().unwrap();
    let config = quota_config(dir.path(), 0);
    let engine = Engine::open(config.clone()).unwrap();

    let item = engine
        .add_work(NewWorkItem::new("flaky batch job").timing(Timing::Async))
        .unwrap();
    backdate(dir.path(), &config);

    let mut worker = StubWorker::failing();
    let summary = engine.run_overnight(&mut worker).unwrap();

    assert_eq!(summary.requeued, vec![item.id]);
    assert_eq!(worker.calls.len(), 1);

    let requeued = engine.get(item.id).unwrap();
    assert_eq!(requeued.status, Status::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.failure_reason.as_deref(), Some("boom"));

    // Backed off into a future execution window
    let scheduled = requeued.scheduled_for.expect("backoff scheduled");
    assert!(scheduled > Utc::now());
    assert!(config.in_window(scheduled));
}

#[test]
fn exhausted_retries_surface_as_permanent_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = quota_config(dir.path(), 0);
    let engine = Engine::open(config.clone()).unwrap();

    let item = engine
        .add_work(NewWorkItem::new("doomed batch job").timing(Timing::Async))
        .unwrap();

    let mut worker = StubWorker::failing();
    for _ in 0..3 {
        backdate(dir.path(), &config);
        engine.run_overnight(&mut worker).unwrap();
    }

    assert_eq!(worker.calls.len(), 3);
    let dead = engine.get(item.id).unwrap();
    assert_eq!(dead.status, Status::PermanentlyFailed);
    assert_eq!(dead.retry_count, 3);

    // Reported to the next session, never retried again
    let summary = engine.status_summary().unwrap();
    assert_eq!(summary.permanent_failures.len(), 1);
    backdate(dir.path(), &config);
    let rerun = engine.run_overnight(&mut worker).unwrap();
    assert!(rerun.completed.is_empty());
    assert_eq!(worker.calls.len(), 3);
}

// ---------------------------------------------------------------------------
// Window discipline
// ---------------------------------------------------------------------------

#[test]
fn wall_clock_cap_halts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        window_cap_minutes: 0,
        ..quota_config(dir.path(), 0)
    };
    let engine = Engine::open(config.clone()).unwrap();

    engine
        .add_work(NewWorkItem::new("never reached").timing(Timing::Async))
        .unwrap();
    backdate(dir.path(), &config);

    let mut worker = StubWorker::succeeding();
    let summary = engine.run_overnight(&mut worker).unwrap();

    assert!(summary.hit_cap);
    assert!(summary.completed.is_empty());
    assert!(worker.calls.is_empty());
}

#[test]
fn abandoned_active_items_are_swept_and_requeued() {
    let dir = tempfile::tempdir().unwrap();
    let config = quota_config(dir.path(), 0);
    let engine = Engine::open(config.clone()).unwrap();

    let item = engine
        .add_work(NewWorkItem::new("left behind by a crash").timing(Timing::Async))
        .unwrap();

    // Simulate a previous cycle that admitted the item and died
    let store = Store::open(dir.path()).unwrap();
    store
        .with_transaction(&config, |ledger| {
            let item = ledger.items.get_mut(&item.id).unwrap();
            item.status = Status::Active;
            item.started_at = Some(Utc::now() - Duration::hours(4));
            Ok(())
        })
        .unwrap();

    let mut worker = StubWorker::succeeding();
    let summary = engine.run_overnight(&mut worker).unwrap();

    assert_eq!(summary.swept, vec![item.id]);
    let swept = engine.get(item.id).unwrap();
    assert_eq!(swept.status, Status::Queued);
    assert_eq!(swept.retry_count, 1);
    // Backed off to a future window, so it did not re-run this cycle
    assert!(worker.calls.is_empty());
}

#[test]
fn interactive_sync_work_is_invisible_to_the_runner() {
    let dir = tempfile::tempdir().unwrap();
    let config = quota_config(dir.path(), 0);
    let engine = Engine::open(config.clone()).unwrap();

    let sync_item = engine
        .add_work(NewWorkItem::new("desk work").timing(Timing::Sync))
        .unwrap();
    engine.schedule_next().unwrap();
    assert_eq!(engine.get(sync_item.id).unwrap().status, Status::Active);

    let mut worker = StubWorker::failing();
    let summary = engine.run_overnight(&mut worker).unwrap();

    // Not executed, not swept: the sync path owns it
    assert!(worker.calls.is_empty());
    assert!(summary.swept.is_empty());
    assert_eq!(engine.get(sync_item.id).unwrap().status, Status::Active);
}
