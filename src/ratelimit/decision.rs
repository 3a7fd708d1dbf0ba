//! Admission request and decision types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::rules::{RuleId, Scope};
use crate::config::duration_ms;

/// `remaining` reported when no limit applies (allow-listed, no rule, disabled).
pub const UNLIMITED_REMAINING: u64 = u64::MAX;

/// Free-form request attributes carried into the audit log.
///
/// Well-known keys are listed in [`metadata_keys`]; callers may add others.
pub type Metadata = BTreeMap<String, String>;

/// Well-known [`Metadata`] keys.
pub mod metadata_keys {
    pub const REQUEST_ID: &str = "request_id";
    pub const METHOD: &str = "method";
    pub const USER_AGENT: &str = "user_agent";
    pub const ORIGIN: &str = "origin";
}

/// A single request presented for admission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Key the bucket is tracked against
    pub identifier: String,
    pub scope: Scope,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl AdmissionRequest {
    pub fn new(identifier: impl Into<String>, scope: Scope) -> Self {
        Self {
            identifier: identifier.into(),
            scope,
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The value a rule pattern of this request's scope is matched against.
    pub fn match_subject(&self) -> &str {
        let specific = match self.scope {
            Scope::Endpoint => self.endpoint.as_deref(),
            Scope::User => self.user_id.as_deref(),
            Scope::Ip => self.ip_address.as_deref(),
            Scope::Global => None,
        };
        specific.unwrap_or(&self.identifier)
    }

    /// Every identity the allow and deny lists are consulted for.
    pub fn list_subjects(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.identifier.as_str())
            .chain(self.ip_address.as_deref())
            .chain(self.user_id.as_deref())
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Engine switched off by configuration
    Disabled,
    Denylisted,
    Allowlisted,
    /// No active rule matched; fail-open
    NoMatchingRule,
    WithinLimit,
    LimitExceeded,
    /// Bucket already blocked; answered without recounting
    StillBlocked,
    /// Internal fault; fail-open
    FailOpen,
}

/// Admission decision returned for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    /// How long the caller should wait; `None` while blocked means indefinitely
    #[serde(default, rename = "retry_after_ms", with = "duration_ms::option")]
    pub retry_after: Option<Duration>,
    pub blocked: bool,
    pub block_expiry: Option<DateTime<Utc>>,
    pub rule_id: Option<RuleId>,
    pub reason: DecisionReason,
}

impl Decision {
    /// An unconditional allow with unlimited remaining quota.
    pub fn unlimited(reason: DecisionReason, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: UNLIMITED_REMAINING,
            reset_time: now,
            retry_after: None,
            blocked: false,
            block_expiry: None,
            rule_id: None,
            reason,
        }
    }
}
