//! Per-tier renewable budget tracking.
//!
//! Each tier has a daily limit, a held-back reserve fraction, and a
//! running `used` count that resets at a fixed wall-clock boundary.
//! Checks are fail-closed: an unknown tier never admits work, and the
//! reserve is invisible to admission so a buffer always survives the day.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TierConfig;
use crate::error::{Error, Result};
use crate::model::{WorkId, WorkItem};

/// Budget state for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierState {
    /// Daily budget units. 0 means unlimited.
    pub limit: u64,
    /// Fraction of the limit held back from admission.
    pub reserve_fraction: f64,
    /// Units consumed since the last reset. Monotonic within a cycle.
    pub used: u64,
    /// Next renewal boundary.
    pub resets_at: DateTime<Utc>,
}

impl TierState {
    /// Budget still available to admission: limit * (1 - reserve) - used.
    pub fn usable(&self) -> u64 {
        if self.limit == 0 {
            return u64::MAX;
        }
        let headroom = (self.limit as f64 * (1.0 - self.reserve_fraction)).floor() as u64;
        headroom.saturating_sub(self.used)
    }
}

/// Budget ledger across all configured tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaLedger {
    pub tiers: BTreeMap<String, TierState>,
}

impl QuotaLedger {
    pub fn from_config(tiers: &[TierConfig], now: DateTime<Utc>) -> Self {
        let tiers = tiers
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    TierState {
                        limit: t.daily_limit,
                        reserve_fraction: t.reserve_fraction,
                        used: 0,
                        resets_at: next_daily_boundary(now),
                    },
                )
            })
            .collect();
        Self { tiers }
    }

    /// Roll any tier past its renewal boundary back to zero. Returns the
    /// names of the tiers that reset.
    pub fn maybe_reset(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut reset = Vec::new();
        for (name, tier) in &mut self.tiers {
            if now >= tier.resets_at {
                tier.used = 0;
                while tier.resets_at <= now {
                    tier.resets_at += Duration::days(1);
                }
                reset.push(name.clone());
            }
        }
        reset
    }

    /// Usable budget for a tier, or None if the tier is not configured.
    pub fn usable(&self, tier: &str) -> Option<u64> {
        self.tiers.get(tier).map(TierState::usable)
    }

    /// Would admitting `amount` units exceed the tier's usable budget?
    /// Unknown tiers refuse everything: a config gap should surface, not
    /// spend unbudgeted quota.
    pub fn would_exceed(&self, tier: &str, amount: u64) -> bool {
        match self.usable(tier) {
            Some(usable) => amount > usable,
            None => true,
        }
    }

    /// Record consumed units against a tier. Returns the new `used` total.
    pub fn record_usage(&mut self, tier: &str, amount: u64) -> Result<u64> {
        let state = self
            .tiers
            .get_mut(tier)
            .ok_or_else(|| Error::Validation(format!("unknown tier: {tier}")))?;
        state.used = state.used.saturating_add(amount);
        Ok(state.used)
    }

    /// Dry-run admission of a score-ordered batch: which items fit the
    /// remaining usable budget, and which trailing items must defer.
    ///
    /// `pending` must already be sorted highest-score first; the greedy
    /// walk charges each fitting item against its tier.
    pub fn forecast<'a>(&self, pending: impl IntoIterator<Item = &'a WorkItem>) -> Forecast {
        let mut remaining: BTreeMap<&str, u64> = self
            .tiers
            .iter()
            .map(|(name, tier)| (name.as_str(), tier.usable()))
            .collect();

        let mut forecast = Forecast::default();
        for item in pending {
            let amount = u64::from(item.estimated_quota);
            forecast.total_requested += amount;
            match remaining.get_mut(item.tier.as_str()) {
                Some(left) if amount <= *left => {
                    *left -= amount;
                    forecast.fits.push(item.id);
                }
                _ => forecast.deferred.push(item.id),
            }
        }
        forecast
    }
}

/// Result of a budget dry run over pending work.
#[derive(Debug, Clone, Default)]
pub struct Forecast {
    /// Items that fit the usable budget, in admission order.
    pub fits: Vec<WorkId>,
    /// Items that would need to wait for the next renewal.
    pub deferred: Vec<WorkId>,
    /// Total units the whole batch asked for.
    pub total_requested: u64,
}

/// The next midnight (UTC) strictly after `now`.
fn next_daily_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}
