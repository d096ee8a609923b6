//! Typed configuration with documented defaults.
//!
//! Every tuning constant the coordinator uses lives here: WIP bounds,
//! stall threshold, controller cutoffs, the unblock-score weight, budget
//! tiers, and the execution windows. These are policy, not part of the
//! correctness contract; tests pin the defaults, nothing else relies on
//! the exact numbers.
//!
//! Loaded from an optional `shiftq.toml`, then overridden from the
//! environment. In local dev, call `dotenvy::dotenv().ok()` first.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One budget tier: a renewable daily allowance with a held-back reserve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// Daily budget units. 0 means unlimited.
    pub daily_limit: u64,
    /// Fraction of the limit held back from admission decisions.
    #[serde(default = "default_reserve_fraction")]
    pub reserve_fraction: f64,
}

fn default_reserve_fraction() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the state record, lock file, events, and results.
    pub state_dir: PathBuf,

    /// Failures before an item becomes permanently failed.
    pub max_retries: u32,

    /// WIP limit the ledger starts with.
    pub initial_wip: usize,
    /// Clamp range for the adaptive controller.
    pub min_wip: usize,
    pub max_wip: usize,

    /// Active minutes beyond which an item is reported stalled.
    pub stall_threshold_minutes: i64,

    /// Trailing window the controller computes its rates over.
    pub metrics_window_minutes: i64,
    /// Stall rate above which the controller drops to focus mode (limit 1).
    pub focus_stall_rate: f64,
    /// Completions per hour above which throughput mode is considered.
    pub throughput_completions_per_hour: f64,
    /// Stall rate below which throughput mode (limit 4) is allowed.
    pub throughput_stall_rate: f64,

    /// Weight on unblock_count in the admission score.
    pub unblock_weight: u32,

    /// Hours during which a human is assumed present.
    pub active_start: NaiveTime,
    pub active_end: NaiveTime,

    /// Deferred execution window. May wrap past midnight.
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    /// Hard wall-clock cap on one overnight run.
    pub window_cap_minutes: i64,

    /// Retry backoff for deferred failures: base, doubled per retry, capped.
    pub retry_backoff_minutes: i64,
    pub retry_backoff_cap_minutes: i64,

    /// Tier assigned to items that do not name one.
    pub default_tier: String,
    pub tiers: Vec<TierConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".shiftq"),
            max_retries: 3,
            initial_wip: 3,
            min_wip: 1,
            max_wip: 4,
            stall_threshold_minutes: 60,
            metrics_window_minutes: 120,
            focus_stall_rate: 0.30,
            throughput_completions_per_hour: 2.0,
            throughput_stall_rate: 0.10,
            unblock_weight: 2,
            active_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            active_end: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            window_start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
            window_cap_minutes: 180,
            retry_backoff_minutes: 15,
            retry_backoff_cap_minutes: 120,
            default_tier: "standard".to_string(),
            tiers: vec![TierConfig {
                name: "standard".to_string(),
                daily_limit: 0,
                reserve_fraction: 0.1,
            }],
        }
    }
}

impl Config {
    /// Load configuration: defaults, then a TOML file if present, then
    /// environment overrides. Fails fast on malformed input.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Path::new("shiftq.toml");
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(dir) = std::env::var("SHIFTQ_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_wip < 1 {
            return Err(Error::Config("min_wip must be at least 1".to_string()));
        }
        if self.min_wip > self.max_wip {
            return Err(Error::Config(format!(
                "min_wip {} exceeds max_wip {}",
                self.min_wip, self.max_wip
            )));
        }
        if !(self.min_wip..=self.max_wip).contains(&self.initial_wip) {
            return Err(Error::Config(format!(
                "initial_wip {} outside [{}, {}]",
                self.initial_wip, self.min_wip, self.max_wip
            )));
        }
        for tier in &self.tiers {
            if !(0.0..1.0).contains(&tier.reserve_fraction) {
                return Err(Error::Config(format!(
                    "tier {}: reserve_fraction {} outside [0, 1)",
                    tier.name, tier.reserve_fraction
                )));
            }
        }
        if !self.tiers.iter().any(|t| t.name == self.default_tier) {
            return Err(Error::Config(format!(
                "default_tier {} is not a configured tier",
                self.default_tier
            )));
        }
        Ok(())
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::minutes(self.stall_threshold_minutes)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::minutes(self.metrics_window_minutes)
    }

    pub fn window_cap(&self) -> Duration {
        Duration::minutes(self.window_cap_minutes)
    }

    /// Is `at` inside the deferred execution window? Handles windows that
    /// wrap past midnight (e.g. 22:00 to 01:00).
    pub fn in_window(&self, at: DateTime<Utc>) -> bool {
        in_range(at.time(), self.window_start, self.window_end)
    }

    /// Is `at` inside the hours a human is assumed present?
    pub fn in_active_hours(&self, at: DateTime<Utc>) -> bool {
        in_range(at.time(), self.active_start, self.active_end)
    }

    /// The earliest instant at or after `now` inside the execution window.
    pub fn next_window_open(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.in_window(now) {
            return now;
        }
        let today_open = now.date_naive().and_time(self.window_start).and_utc();
        if today_open > now {
            today_open
        } else {
            today_open + Duration::days(1)
        }
    }

    /// Move `at` into the execution window if it fell outside one.
    pub fn clamp_into_window(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.next_window_open(at)
    }
}

fn in_range(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        // Wraps past midnight
        t >= start || t < end
    }
}
