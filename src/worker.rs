//! Worker collaborators: the opaque executors that actually do the work.
//!
//! The coordinator never calls into a worker's internals. It hands over a
//! work item and a scratch directory, and gets back an outcome. The
//! bundled `CommandWorker` runs one external process per item with a
//! small env contract; anything that can read `work.json` and write
//! `outcome.json` can be a worker.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use tracing::{debug, warn};

use crate::model::{Outcome, WorkItem};

/// An opaque executor. Implementations report the outcome; they never
/// touch coordinator state directly.
pub trait Worker {
    fn execute(&mut self, item: &WorkItem, work_dir: &Path) -> Outcome;
}

/// Runs a configured executable once per work item.
///
/// Contract: the item is serialized to `<work_dir>/work.json`; the
/// command runs with the work dir as its working directory and the
/// `SHIFTQ_WORK_ID`, `SHIFTQ_WORK_DIR`, and `SHIFTQ_TIER` variables set;
/// it writes `<work_dir>/outcome.json` before exiting zero.
pub struct CommandWorker {
    command: PathBuf,
}

impl CommandWorker {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Worker for CommandWorker {
    fn execute(&mut self, item: &WorkItem, work_dir: &Path) -> Outcome {
        let start = Instant::now();

        let work_json = match serde_json::to_string_pretty(item) {
            Ok(json) => json,
            Err(e) => return failed(format!("serialize work item: {e}"), start),
        };
        if let Err(e) = std::fs::write(work_dir.join("work.json"), work_json) {
            return failed(format!("write work.json: {e}"), start);
        }

        // Resolve relative command paths against the process CWD, not the
        // work dir. Command::new + current_dir resolves relative paths
        // after chdir, which would look in the work dir instead.
        let command = if self.command.is_relative() {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(&self.command),
                Err(e) => return failed(format!("resolve command path: {e}"), start),
            }
        } else {
            self.command.clone()
        };

        debug!(
            id = %item.id,
            command = %command.display(),
            dir = %work_dir.display(),
            "running worker command"
        );

        let status = Command::new(&command)
            .current_dir(work_dir)
            .env("SHIFTQ_WORK_ID", item.id.0.to_string())
            .env("SHIFTQ_WORK_DIR", work_dir)
            .env("SHIFTQ_TIER", &item.tier)
            .status();

        let status = match status {
            Ok(status) => status,
            Err(e) => return failed(format!("spawn {}: {e}", command.display()), start),
        };
        if !status.success() {
            return failed(
                format!(
                    "worker exited with status {}",
                    status.code().unwrap_or(-1)
                ),
                start,
            );
        }

        match std::fs::read_to_string(work_dir.join("outcome.json")) {
            Ok(text) => match serde_json::from_str::<Outcome>(&text) {
                Ok(mut outcome) => {
                    outcome.duration_ms = start.elapsed().as_millis() as u64;
                    outcome
                }
                Err(e) => failed(format!("bad outcome.json: {e}"), start),
            },
            Err(e) => failed(format!("missing outcome.json: {e}"), start),
        }
    }
}

fn failed(error: String, start: Instant) -> Outcome {
    warn!(error = %error, "worker execution failed");
    Outcome {
        success: false,
        data: None,
        error: Some(error),
        duration_ms: start.elapsed().as_millis() as u64,
        quota_used: None,
    }
}
