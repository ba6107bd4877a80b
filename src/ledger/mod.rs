//! Per-endpoint reply history with running statistics.
//!
//! Replies are kept most recent first. The aggregates in [`LedgerStats`]
//! are maintained incrementally on [`Ledger::append`] and can be recomputed
//! from scratch with [`Ledger::rebuild`]; both paths fold replies oldest to
//! newest so they produce identical values.

mod export;

pub use export::*;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::round2;
use crate::probe::{Reply, ReplyStatus};

/// Aggregates over every reply currently held by a ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerStats {
    pub sent_count: u64,
    pub succeed_count: u64,
    pub failed_count: u64,
    pub consecutive_succeed_count: u64,
    pub consecutive_failed_count: u64,
    pub max_consecutive_succeed_count: u64,
    pub max_consecutive_failed_count: u64,
    /// `+inf` until a successful reply with a finite duration is seen.
    #[serde(serialize_with = "serialize_sentinel")]
    pub min_elapsed_ms: f64,
    #[serde(serialize_with = "serialize_sentinel")]
    pub max_elapsed_ms: f64,
    pub total_elapsed_ms: f64,
    /// Number of successful replies that contributed to the latency sums.
    pub timed_count: u64,
    pub last_succeeded_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl Default for LedgerStats {
    fn default() -> Self {
        Self {
            sent_count: 0,
            succeed_count: 0,
            failed_count: 0,
            consecutive_succeed_count: 0,
            consecutive_failed_count: 0,
            max_consecutive_succeed_count: 0,
            max_consecutive_failed_count: 0,
            min_elapsed_ms: f64::INFINITY,
            max_elapsed_ms: f64::INFINITY,
            total_elapsed_ms: 0.0,
            timed_count: 0,
            last_succeeded_at: None,
            last_failed_at: None,
            last_executed_at: None,
        }
    }
}

impl LedgerStats {
    fn record(&mut self, reply: &Reply) {
        self.sent_count += 1;
        if reply.succeeded() {
            self.succeed_count += 1;
            self.consecutive_succeed_count += 1;
            self.consecutive_failed_count = 0;
            self.max_consecutive_succeed_count = self.max_consecutive_succeed_count.max(self.consecutive_succeed_count);
            self.last_succeeded_at = Some(reply.sent_at());

            let elapsed = reply.elapsed_ms();
            if elapsed.is_finite() {
                if self.timed_count == 0 {
                    self.min_elapsed_ms = elapsed;
                    self.max_elapsed_ms = elapsed;
                } else {
                    self.min_elapsed_ms = self.min_elapsed_ms.min(elapsed);
                    self.max_elapsed_ms = self.max_elapsed_ms.max(elapsed);
                }
                self.total_elapsed_ms += elapsed;
                self.timed_count += 1;
            }
        } else {
            self.failed_count += 1;
            self.consecutive_failed_count += 1;
            self.consecutive_succeed_count = 0;
            self.max_consecutive_failed_count = self.max_consecutive_failed_count.max(self.consecutive_failed_count);
            self.last_failed_at = Some(reply.sent_at());
        }
        self.last_executed_at = Some(reply.sent_at());
    }
}

/// Ordered reply history for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    replies: VecDeque<Reply>,
    stats: LedgerStats,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `reply` as the most recent entry and fold it into the stats.
    pub fn append(&mut self, reply: Reply) {
        self.stats.record(&reply);
        self.replies.push_front(reply);
    }

    /// Attach older persisted replies (most recent first) behind the
    /// current ones, then recompute the aggregates.
    pub fn restore(&mut self, older: impl IntoIterator<Item = Reply>) {
        self.replies.extend(older);
        self.rebuild();
    }

    /// Reset every aggregate and recompute it from the retained replies.
    pub fn rebuild(&mut self) {
        let mut stats = LedgerStats::default();
        for reply in self.replies.iter().rev() {
            stats.record(reply);
        }
        self.stats = stats;
    }

    /// Drop the oldest replies beyond `max`. Returns how many were removed.
    ///
    /// The aggregates are rebuilt afterwards so they describe exactly the
    /// retained replies.
    pub fn evict_to(&mut self, max: usize) -> usize {
        if self.replies.len() <= max {
            return 0;
        }
        let removed = self.replies.len() - max;
        self.replies.truncate(max);
        self.rebuild();
        removed
    }

    pub fn clear(&mut self) {
        self.replies.clear();
        self.stats = LedgerStats::default();
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Replies, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &Reply> {
        self.replies.iter()
    }

    pub fn latest(&self) -> Option<&Reply> {
        self.replies.front()
    }

    pub fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    pub fn last_status(&self) -> ReplyStatus {
        self.latest().map(Reply::status).unwrap_or(ReplyStatus::Unknown)
    }

    /// Percentage of successful replies, two decimals.
    pub fn success_percentage(&self) -> f64 {
        percentage(self.stats.succeed_count, self.stats.sent_count)
    }

    pub fn failure_percentage(&self) -> f64 {
        percentage(self.stats.failed_count, self.stats.sent_count)
    }

    /// Mean latency of successful replies, `+inf` when there are none.
    pub fn average_elapsed_ms(&self) -> f64 {
        if self.stats.timed_count == 0 {
            return f64::INFINITY;
        }
        round2(self.stats.total_elapsed_ms / self.stats.timed_count as f64)
    }

    /// Whether the newest reply's status differs from the one before it.
    ///
    /// A lone reply counts as a change unless its status is `Unknown`.
    pub fn status_changed(&self) -> bool {
        match (self.replies.front(), self.replies.get(1)) {
            (None, _) => false,
            (Some(latest), None) => latest.status() != ReplyStatus::Unknown,
            (Some(latest), Some(previous)) => latest.status() != previous.status(),
        }
    }

    /// Summary view used by the API and exports.
    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            replies: self.len(),
            last_status: self.last_status(),
            success_percentage: self.success_percentage(),
            failure_percentage: self.failure_percentage(),
            average_elapsed_ms: finite_or_none(self.average_elapsed_ms()),
            stats: self.stats.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub replies: usize,
    pub last_status: ReplyStatus,
    pub success_percentage: f64,
    pub failure_percentage: f64,
    pub average_elapsed_ms: Option<f64>,
    pub stats: LedgerStats,
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / total as f64)
}

fn finite_or_none(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn serialize_sentinel<S: serde::Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    match finite_or_none(*value) {
        Some(v) => serializer.serialize_f64(v),
        None => serializer.serialize_none(),
    }
}
