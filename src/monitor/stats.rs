//! Aggregate admission statistics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ratelimit::{Decision, DecisionReason, RuleId};

/// Number of entries reported in each top-N list.
pub const TOP_N: usize = 10;

/// One row of a top-N list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopEntry {
    pub key: String,
    pub count: u64,
}

/// Point-in-time view of the engine's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub allowlist_hits: u64,
    pub denylist_hits: u64,
    pub no_rule: u64,
    pub fail_open: u64,
    pub active_buckets: usize,
    pub blocked_buckets: usize,
    pub top_blocked_identifiers: Vec<TopEntry>,
    pub top_blocked_rules: Vec<TopEntry>,
    pub peak_requests_per_second: u64,
}

#[derive(Debug, Default)]
struct RateTracker {
    second: i64,
    count: u64,
    peak: u64,
}

/// Lock-light counters updated on every decision.
#[derive(Debug, Default)]
pub struct EngineStats {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    allowlist_hits: AtomicU64,
    denylist_hits: AtomicU64,
    no_rule: AtomicU64,
    fail_open: AtomicU64,
    blocked_by_identifier: DashMap<String, u64>,
    blocked_by_rule: DashMap<RuleId, u64>,
    rate: Mutex<RateTracker>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, identifier: &str, decision: &Decision, now: DateTime<Utc>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.track_rate(now);

        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            *self
                .blocked_by_identifier
                .entry(identifier.to_string())
                .or_insert(0) += 1;
            if let Some(rule_id) = decision.rule_id {
                *self.blocked_by_rule.entry(rule_id).or_insert(0) += 1;
            }
        }

        let counter = match decision.reason {
            DecisionReason::Allowlisted => &self.allowlist_hits,
            DecisionReason::Denylisted => &self.denylist_hits,
            DecisionReason::NoMatchingRule => &self.no_rule,
            DecisionReason::FailOpen => &self.fail_open,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn track_rate(&self, now: DateTime<Utc>) {
        let second = now.timestamp();
        let mut rate = self.rate.lock();
        if rate.second != second {
            rate.second = second;
            rate.count = 0;
        }
        rate.count += 1;
        rate.peak = rate.peak.max(rate.count);
    }

    pub fn snapshot(&self, active_buckets: usize, blocked_buckets: usize) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            allowlist_hits: self.allowlist_hits.load(Ordering::Relaxed),
            denylist_hits: self.denylist_hits.load(Ordering::Relaxed),
            no_rule: self.no_rule.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            active_buckets,
            blocked_buckets,
            top_blocked_identifiers: top_n(&self.blocked_by_identifier, TOP_N),
            top_blocked_rules: top_n(&self.blocked_by_rule, TOP_N),
            peak_requests_per_second: self.rate.lock().peak,
        }
    }

    /// Bound the per-identifier table to the `max_entries` heaviest offenders.
    ///
    /// Ties at the cutoff are broken by identifier so exactly `max_entries`
    /// remain.
    pub fn trim(&self, max_entries: usize) -> usize {
        let len = self.blocked_by_identifier.len();
        if len <= max_entries {
            return 0;
        }
        let mut ranked: Vec<(String, u64)> = self
            .blocked_by_identifier
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut removed = 0;
        for (identifier, _) in ranked.into_iter().skip(max_entries) {
            if self.blocked_by_identifier.remove(&identifier).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

fn top_n<K>(counts: &DashMap<K, u64>, n: usize) -> Vec<TopEntry>
where
    K: ToString + Eq + Hash,
{
    let mut entries: Vec<TopEntry> = counts
        .iter()
        .map(|entry| TopEntry {
            key: entry.key().to_string(),
            count: *entry.value(),
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(n);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
            + chrono::Duration::milliseconds(ms)
    }

    fn denied(rule_id: RuleId, now: DateTime<Utc>) -> Decision {
        Decision {
            allowed: false,
            remaining: 0,
            reset_time: now,
            retry_after: None,
            blocked: true,
            block_expiry: None,
            rule_id: Some(rule_id),
            reason: DecisionReason::LimitExceeded,
        }
    }

    #[test]
    fn test_counts_by_outcome() {
        let stats = EngineStats::new();
        let rule = RuleId::new();
        stats.record("a", &Decision::unlimited(DecisionReason::NoMatchingRule, at(0)), at(0));
        stats.record("a", &Decision::unlimited(DecisionReason::Allowlisted, at(0)), at(0));
        stats.record("b", &denied(rule, at(0)), at(0));
        stats.record("b", &denied(rule, at(0)), at(0));
        stats.record("c", &denied(rule, at(0)), at(0));

        let snapshot = stats.snapshot(3, 1);
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.allowed, 2);
        assert_eq!(snapshot.blocked, 3);
        assert_eq!(snapshot.no_rule, 1);
        assert_eq!(snapshot.allowlist_hits, 1);
        assert_eq!(
            snapshot.top_blocked_identifiers,
            vec![
                TopEntry { key: "b".to_string(), count: 2 },
                TopEntry { key: "c".to_string(), count: 1 },
            ]
        );
        assert_eq!(snapshot.top_blocked_rules[0].count, 3);
        assert_eq!(snapshot.active_buckets, 3);
    }

    #[test]
    fn test_peak_rate_per_second() {
        let stats = EngineStats::new();
        let allow = Decision::unlimited(DecisionReason::NoMatchingRule, at(0));
        for ms in [0, 100, 200, 1100, 2000, 2001, 2002, 2003] {
            stats.record("x", &allow, at(ms));
        }
        assert_eq!(stats.snapshot(0, 0).peak_requests_per_second, 4);
    }

    #[test]
    fn test_trim_with_ties_keeps_max_entries() {
        let stats = EngineStats::new();
        let rule = RuleId::new();
        for id in ["e", "d", "c", "b", "a"] {
            stats.record(id, &denied(rule, at(0)), at(0));
        }
        assert_eq!(stats.trim(3), 2);
        let keys: Vec<String> = stats
            .snapshot(0, 0)
            .top_blocked_identifiers
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_trim_keeps_heaviest() {
        let stats = EngineStats::new();
        let rule = RuleId::new();
        for (id, n) in [("a", 5), ("b", 3), ("c", 1), ("d", 1)] {
            for _ in 0..n {
                stats.record(id, &denied(rule, at(0)), at(0));
            }
        }
        assert_eq!(stats.trim(2), 2);
        let keys: Vec<String> = stats
            .snapshot(0, 0)
            .top_blocked_identifiers
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
