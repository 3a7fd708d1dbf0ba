//! Sliding window counter and per-bucket blocking state.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use super::rules::Rule;
use crate::error::{Result, TurnstileError};

/// `t + d`, failing instead of panicking on overflow.
pub(crate) fn shift_forward(t: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>> {
    let d = chrono::Duration::from_std(d).map_err(|_| TurnstileError::TimeOverflow)?;
    t.checked_add_signed(d).ok_or(TurnstileError::TimeOverflow)
}

/// `t - d`, failing instead of panicking on overflow.
pub(crate) fn shift_back(t: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>> {
    let d = chrono::Duration::from_std(d).map_err(|_| TurnstileError::TimeOverflow)?;
    t.checked_sub_signed(d).ok_or(TurnstileError::TimeOverflow)
}

/// Time from `now` until `later`, zero if `later` has passed.
pub(crate) fn until(later: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (later - now).to_std().unwrap_or(Duration::ZERO)
}

/// Timestamps of admitted requests, oldest first.
///
/// Only admitted requests are stored and a bucket never admits more than
/// `limit` requests per window, so the deque holds at most `limit` entries.
/// Expired entries are popped from the front, which keeps each check
/// amortized O(1).
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    hits: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries at or before `window_start`.
    pub fn evict(&mut self, window_start: DateTime<Utc>) {
        while self.hits.front().is_some_and(|t| *t <= window_start) {
            self.hits.pop_front();
        }
    }

    /// Number of entries strictly after `window_start`.
    pub fn count(&mut self, window_start: DateTime<Utc>) -> u64 {
        self.evict(window_start);
        self.hits.len() as u64
    }

    /// Record an admitted request, keeping at most `limit` entries.
    ///
    /// Callers sample the clock before taking the bucket lock, so `at` can
    /// trail the newest entry slightly; it is inserted in order to keep the
    /// front-eviction in `evict` exact.
    pub fn record(&mut self, at: DateTime<Utc>, limit: u64) {
        if self.hits.back().map_or(true, |last| *last <= at) {
            self.hits.push_back(at);
        } else {
            let pos = self.hits.partition_point(|t| *t <= at);
            self.hits.insert(pos, at);
        }
        while self.hits.len() as u64 > limit {
            self.hits.pop_front();
        }
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.hits.front().copied()
    }

    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.hits.back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Externally visible lifecycle of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketState {
    /// No bucket exists yet for the (rule, identifier) pair
    Fresh,
    /// Counting requests against the window
    Active,
    /// Denying every request until the block expires
    Blocked,
}

/// State change produced by an evaluation that callers may want to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The bucket just entered the blocked state
    Blocked { observed: u64 },
    /// A blocked identifier kept sending past the persistent-violation threshold
    PersistentViolation { observed: u64 },
}

/// Outcome of evaluating one request against a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    pub retry_after: Option<Duration>,
    pub blocked: bool,
    pub block_expiry: Option<DateTime<Utc>>,
    /// True when the answer came from the blocked fast path
    pub short_circuited: bool,
    pub transition: Option<Transition>,
}

/// Counting and blocking state for one (rule, identifier) pair.
#[derive(Debug, Clone)]
pub struct Bucket {
    window: SlidingWindow,
    window_len: Duration,
    blocked: bool,
    block_expiry: Option<DateTime<Utc>>,
    denied_while_blocked: u64,
    persistent_reported: bool,
    created_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Bucket {
    pub fn new(rule: &Rule, now: DateTime<Utc>) -> Self {
        Self {
            window: SlidingWindow::new(),
            window_len: rule.window,
            blocked: false,
            block_expiry: None,
            denied_while_blocked: 0,
            persistent_reported: false,
            created_at: now,
            last_seen: now,
        }
    }

    /// Evaluate one request and update the bucket.
    ///
    /// `persistent_threshold` is the observed request count above which a
    /// blocked identifier is reported once per block period.
    pub fn evaluate(
        &mut self,
        rule: &Rule,
        now: DateTime<Utc>,
        persistent_threshold: u64,
    ) -> Result<Evaluation> {
        self.last_seen = now;
        self.window_len = rule.window;

        if let Some(expiry) = self.active_block(now) {
            return Ok(self.deny_while_blocked(rule, expiry, now, persistent_threshold));
        }
        if self.blocked {
            // Block elapsed; the window is evaluated from scratch below.
            self.clear_block();
        }

        let window_start = shift_back(now, rule.window)?;
        let count = self.window.count(window_start);
        let reset_time = shift_forward(now, rule.window)?;

        if count < rule.limit {
            self.window.record(now, rule.limit);
            return Ok(Evaluation {
                allowed: true,
                remaining: rule.limit - count - 1,
                reset_time,
                retry_after: None,
                blocked: false,
                block_expiry: None,
                short_circuited: false,
                transition: None,
            });
        }

        let observed = count + 1;
        if rule.block_duration.is_zero() {
            // No blocked state; retry once the oldest hit leaves the window.
            let retry_after = match self.window.oldest() {
                Some(oldest) => until(shift_forward(oldest, rule.window)?, now),
                None => Duration::ZERO,
            };
            return Ok(Evaluation {
                allowed: false,
                remaining: 0,
                reset_time,
                retry_after: Some(retry_after),
                blocked: false,
                block_expiry: None,
                short_circuited: false,
                transition: None,
            });
        }

        let expiry = shift_forward(now, rule.block_duration)?;
        self.blocked = true;
        self.block_expiry = Some(expiry);

        Ok(Evaluation {
            allowed: false,
            remaining: 0,
            reset_time,
            retry_after: Some(rule.block_duration),
            blocked: true,
            block_expiry: Some(expiry),
            short_circuited: false,
            transition: Some(Transition::Blocked { observed }),
        })
    }

    fn deny_while_blocked(
        &mut self,
        rule: &Rule,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
        persistent_threshold: u64,
    ) -> Evaluation {
        self.denied_while_blocked += 1;
        let observed = rule
            .limit
            .saturating_add(1)
            .saturating_add(self.denied_while_blocked);

        let transition = if !self.persistent_reported && observed > persistent_threshold {
            self.persistent_reported = true;
            Some(Transition::PersistentViolation { observed })
        } else {
            None
        };

        Evaluation {
            allowed: false,
            remaining: 0,
            reset_time: expiry,
            retry_after: Some(until(expiry, now)),
            blocked: true,
            block_expiry: Some(expiry),
            short_circuited: true,
            transition,
        }
    }

    fn clear_block(&mut self) {
        self.blocked = false;
        self.block_expiry = None;
        self.denied_while_blocked = 0;
        self.persistent_reported = false;
    }

    /// The block expiry if the bucket is blocked at `now`.
    pub fn active_block(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.blocked, self.block_expiry) {
            (true, Some(expiry)) if expiry > now => Some(expiry),
            _ => None,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> BucketState {
        if self.active_block(now).is_some() {
            BucketState::Blocked
        } else {
            BucketState::Active
        }
    }

    /// Whether the janitor may drop this bucket: not blocked and no hit
    /// inside the most recent `window`.
    ///
    /// `window` is the owning rule's current window, which may differ from
    /// the one seen at the last evaluation if the rule was updated since.
    pub fn is_idle(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.active_block(now).is_some() {
            return false;
        }
        let recent = shift_back(now, window)
            .map(|window_start| self.window.latest().is_some_and(|t| t > window_start))
            .unwrap_or(true);
        !recent
    }

    /// Admitted requests currently inside the window.
    pub fn request_count(&mut self, now: DateTime<Utc>) -> u64 {
        match shift_back(now, self.window_len) {
            Ok(window_start) => self.window.count(window_start),
            Err(_) => 0,
        }
    }

    /// Window length seen at the last evaluation.
    pub fn window(&self) -> Duration {
        self.window_len
    }

    pub fn block_expiry(&self) -> Option<DateTime<Utc>> {
        self.block_expiry
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }
}
