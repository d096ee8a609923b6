//! Adaptive concurrency control.
//!
//! Recomputes the WIP limit from a trailing window of completion and
//! stall observations. High stall rate collapses to a single slot until
//! things drain; sustained healthy throughput earns a fourth slot.
//! Changing the limit never preempts Active items; it only shapes future
//! admission decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::ledger::Ledger;
use crate::model::Status;

/// Which regime the controller chose and the numbers behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WipRecommendation {
    pub wip_limit: usize,
    pub mode: Mode,
    pub completions: usize,
    pub stalls: usize,
    pub completion_rate_per_hour: f64,
    pub stall_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Too much stalling; one slot until the queue drains.
    Focus,
    /// Default regime.
    Balanced,
    /// Healthy completion rate with little stalling.
    Throughput,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Focus => "focus",
            Mode::Balanced => "balanced",
            Mode::Throughput => "throughput",
        };
        write!(f, "{s}")
    }
}

/// Recompute the WIP limit from the trailing metrics window.
///
/// Observations: items completed inside the window (a stall if their
/// active span exceeded the threshold), plus currently Active items
/// already past the threshold. The result is clamped to the configured
/// range.
pub fn recommend(ledger: &Ledger, config: &Config, now: DateTime<Utc>) -> WipRecommendation {
    let window_start = now - config.metrics_window();
    let threshold = config.stall_threshold();

    let mut completions = 0usize;
    let mut stalls = 0usize;

    for item in ledger.items.values() {
        match item.status {
            Status::Completed => {
                let Some(completed_at) = item.completed_at else {
                    continue;
                };
                if completed_at < window_start {
                    continue;
                }
                completions += 1;
                if let Some(started_at) = item.started_at {
                    if completed_at - started_at > threshold {
                        stalls += 1;
                    }
                }
            }
            Status::Active => {
                if let Some(started_at) = item.started_at {
                    if now - started_at > threshold {
                        stalls += 1;
                    }
                }
            }
            _ => {}
        }
    }

    let observations = completions + stalls;
    let stall_rate = if observations == 0 {
        0.0
    } else {
        stalls as f64 / observations as f64
    };
    let window_hours = config.metrics_window().num_minutes() as f64 / 60.0;
    let completion_rate = if window_hours > 0.0 {
        completions as f64 / window_hours
    } else {
        0.0
    };

    let (mode, raw_limit) = if stall_rate > config.focus_stall_rate {
        (Mode::Focus, 1)
    } else if completion_rate > config.throughput_completions_per_hour
        && stall_rate < config.throughput_stall_rate
    {
        (Mode::Throughput, 4)
    } else {
        (Mode::Balanced, 3)
    };

    WipRecommendation {
        wip_limit: raw_limit.clamp(config.min_wip, config.max_wip),
        mode,
        completions,
        stalls,
        completion_rate_per_hour: completion_rate,
        stall_rate,
    }
}
