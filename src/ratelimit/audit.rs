//! Bounded, append-only log of admission decisions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

use super::decision::{Decision, DecisionReason, Metadata};
use super::rules::RuleId;

/// One audited admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub rule_id: Option<RuleId>,
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    pub blocked: bool,
    pub block_expiry: Option<DateTime<Utc>>,
    pub reason: DecisionReason,
    pub metadata: Metadata,
}

impl RequestRecord {
    pub fn from_decision(
        identifier: &str,
        timestamp: DateTime<Utc>,
        decision: &Decision,
        metadata: &Metadata,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            timestamp,
            rule_id: decision.rule_id,
            allowed: decision.allowed,
            remaining: decision.remaining,
            reset_time: decision.reset_time,
            blocked: decision.blocked,
            block_expiry: decision.block_expiry,
            reason: decision.reason,
            metadata: metadata.clone(),
        }
    }
}

/// Ring of the most recent records; the oldest are dropped at capacity.
#[derive(Debug)]
pub struct AuditLog {
    records: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn append(&self, record: RequestRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Drop records with a timestamp at or before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        // Records are kept in arrival order. Concurrent checks can arrive
        // slightly out of timestamp order, so every record is tested.
        records.retain(|r| r.timestamp > cutoff);
        before - records.len()
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        let records = self.records.lock();
        records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
