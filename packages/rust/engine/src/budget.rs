//! Token budget estimation and rolling-window enforcement.
//!
//! Estimates are coarse (~4 chars per token) but only ever compared against
//! ceilings that carry their own headroom. Consumed budget is recorded once
//! a submission is confirmed, never at estimation time, so failed
//! submissions do not poison the rolling counter.

use chrono::{DateTime, Utc};
use tracing::debug;

use fieldsmith_shared::{BudgetConfig, Record};

/// Token cost of one attached image at low detail.
const IMAGE_TOKENS: u64 = 85;

/// Fixed structural overhead per field (markup, separators).
const FIELD_OVERHEAD_TOKENS: u64 = 4;

/// Fixed envelope overhead per record request.
const RECORD_OVERHEAD_TOKENS: u64 = 16;

/// Estimate the token cost of free text (~4 chars per token, rounded up).
pub fn estimate_text(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate the token weight of submitting one record.
pub fn estimate_record(record: &Record) -> u64 {
    let field_chars: usize = record
        .fields
        .iter()
        .map(|(name, value)| name.len() + value.len())
        .sum();

    (field_chars as u64).div_ceil(4)
        + record.fields.len() as u64 * FIELD_OVERHEAD_TOKENS
        + record.image_urls.len() as u64 * IMAGE_TOKENS
        + RECORD_OVERHEAD_TOKENS
}

/// Which ceiling a candidate weight is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    /// Single-request (per-fragment) ceiling.
    PerRequest,
    /// Rolling usage window (e.g. per-day) ceiling.
    RollingWindow,
}

/// Process-wide rolling token usage state.
///
/// Single-owner by construction: the sequencer is the only writer, and
/// chunks are dispatched strictly sequentially. All time-dependent methods
/// take `now` so tests can simulate arbitrary windows deterministically.
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    /// Committed usage entries `(submitted_at, weight)`, oldest first.
    entries: Vec<(DateTime<Utc>, u64)>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    pub fn per_request_ceiling(&self) -> u64 {
        self.config.per_request_ceiling
    }

    /// Evict usage entries that have slid out of the window.
    fn evict(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = now - window;
        self.entries.retain(|(at, _)| *at > cutoff);
    }

    /// Committed usage inside the current window.
    pub fn window_usage(&mut self, now: DateTime<Utc>) -> u64 {
        self.evict(now);
        self.entries.iter().map(|(_, w)| w).sum()
    }

    /// Whether a candidate weight fits the given scope right now.
    pub fn fits(&mut self, weight: u64, scope: BudgetScope, now: DateTime<Utc>) -> bool {
        match scope {
            BudgetScope::PerRequest => weight <= self.config.per_request_ceiling,
            BudgetScope::RollingWindow => {
                let usage = self.window_usage(now);
                usage + weight <= self.config.window_ceiling
            }
        }
    }

    /// Record consumed budget for a confirmed submission.
    pub fn commit(&mut self, weight: u64, now: DateTime<Utc>) {
        self.entries.push((now, weight));
        debug!(weight, total = self.window_usage(now), "budget committed");
    }
}
