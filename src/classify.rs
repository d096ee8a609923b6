//! Temporal classification: does this work need a human present?
//!
//! An ordered table of (signals -> timing) rules, checked top to bottom.
//! Destructive or judgment-heavy signals force Sync no matter what else
//! the description says: safety overrides convenience. Read-only batch
//! signals mark work Async. Everything else is Flexible, and an admission
//! decision (not the classifier) resolves Flexible to now-or-deferred.

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::model::Timing;

/// One classification rule: if any signal matches, the rule's timing wins.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub timing: Timing,
    pub signals: &'static [&'static str],
}

/// The rule table, in priority order. First match wins.
pub const RULES: &[Rule] = &[
    // Destructive or judgment signals: the work may change things
    // irreversibly or needs a decision only a human can make.
    Rule {
        timing: Timing::Sync,
        signals: &[
            "delete",
            "remove",
            "overwrite",
            "drop",
            "migrate",
            "deploy",
            "help me choose",
            "which",
            "choose",
            "decide",
            "review",
            "design",
            "approve",
        ],
    },
    // Read-only or batch signals: safe to run with nobody watching.
    Rule {
        timing: Timing::Async,
        signals: &[
            "search",
            "analyze",
            "analyse",
            "scan",
            "batch",
            "crawl",
            "index",
            "summarize",
            "generate report",
            "backfill",
            "overnight",
        ],
    },
];

/// Classify a description against the rule table.
pub fn classify(description: &str) -> Timing {
    let lowered = description.to_lowercase();
    for rule in RULES {
        if rule.signals.iter().any(|signal| matches(&lowered, signal)) {
            return rule.timing;
        }
    }
    Timing::Flexible
}

/// Match a signal against lowercased text. Multi-word signals match as
/// substrings; single words must match a whole word, so "review" does not
/// fire on "overview".
fn matches(lowered: &str, signal: &str) -> bool {
    if signal.contains(' ') {
        return lowered.contains(signal);
    }
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == signal)
}

/// Where a Flexible item lands once admission has looked at the clock
/// and the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Run on the interactive path now.
    Immediate,
    /// Park for the next execution window.
    Deferred,
}

/// Resolve a Flexible item to immediate or deferred execution.
///
/// Deferred only when nobody is around anyway, or when running now would
/// eat into budget that the overnight window gets back at the daily
/// reset. The fallback is immediate execution: flexible work is never
/// silently deferred while a human is present and budget allows.
pub fn resolve_flexible(config: &Config, now: DateTime<Utc>, quota_headroom: bool) -> Placement {
    if !config.in_active_hours(now) {
        return Placement::Deferred;
    }
    if !quota_headroom {
        return Placement::Deferred;
    }
    Placement::Immediate
}
