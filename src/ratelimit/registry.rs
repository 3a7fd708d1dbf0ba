//! Registry of per-(rule, identifier) buckets.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

use super::counter::{Bucket, BucketState, Evaluation};
use super::rules::{Rule, RuleId};
use crate::error::Result;

/// Key of a bucket: the rule being enforced and the identifier it counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub rule_id: RuleId,
    pub identifier: String,
}

impl BucketKey {
    pub fn new(rule_id: RuleId, identifier: &str) -> Self {
        Self {
            rule_id,
            identifier: identifier.to_string(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.identifier)
    }
}

/// Concurrent bucket map.
///
/// Evaluation runs while holding the map entry, so the read-count,
/// compare, record and block steps for one key are serialized. Different
/// keys only contend when they hash to the same shard.
#[derive(Default)]
pub struct BucketRegistry {
    buckets: DashMap<BucketKey, Bucket>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a request for `identifier` against `rule`, creating the
    /// bucket on first use.
    pub fn evaluate(
        &self,
        rule: &Rule,
        identifier: &str,
        now: DateTime<Utc>,
        persistent_threshold: u64,
    ) -> Result<Evaluation> {
        let key = BucketKey::new(rule.id, identifier);
        trace!(key = %key, "Evaluating bucket");

        let mut bucket = self.buckets.entry(key).or_insert_with(|| {
            debug!(
                rule_id = %rule.id,
                identifier = %identifier,
                limit = rule.limit,
                window_ms = rule.window.as_millis() as u64,
                "Creating new bucket"
            );
            Bucket::new(rule, now)
        });

        bucket.evaluate(rule, now, persistent_threshold)
    }

    pub fn state(&self, rule_id: RuleId, identifier: &str, now: DateTime<Utc>) -> BucketState {
        self.buckets
            .get(&BucketKey::new(rule_id, identifier))
            .map(|bucket| bucket.state(now))
            .unwrap_or(BucketState::Fresh)
    }

    /// Admitted requests inside the current window, if the bucket exists.
    pub fn request_count(
        &self,
        rule_id: RuleId,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        self.buckets
            .get_mut(&BucketKey::new(rule_id, identifier))
            .map(|mut bucket| bucket.request_count(now))
    }

    /// Drop every bucket belonging to a rule.
    pub fn remove_rule(&self, rule_id: RuleId) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, _| key.rule_id != rule_id);
        before.saturating_sub(self.buckets.len())
    }

    /// Drop buckets with no recent activity that are not blocked.
    ///
    /// `windows` holds each rule's current window; buckets of rules missing
    /// from it are judged by the window of their last evaluation.
    pub fn sweep_idle(&self, now: DateTime<Utc>, windows: &HashMap<RuleId, Duration>) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, bucket| {
            let window = windows
                .get(&key.rule_id)
                .copied()
                .unwrap_or_else(|| bucket.window());
            !bucket.is_idle(now, window)
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn blocked_count(&self, now: DateTime<Utc>) -> usize {
        self.buckets
            .iter()
            .filter(|entry| entry.value().active_block(now).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}
