//! Alerts raised when identifiers get blocked or keep violating limits.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{EngineEvent, EventBus};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Rule, RuleId};

/// Unique identifier of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity from how far the observed count overshoots the limit:
    /// above 5x is critical, above 2x high, anything else medium.
    pub fn from_overage(observed: u64, limit: u64) -> Self {
        let limit = limit.max(1);
        if observed > limit.saturating_mul(5) {
            Severity::Critical
        } else if observed > limit.saturating_mul(2) {
            Severity::High
        } else {
            Severity::Medium
        }
    }

    fn raised(self) -> Self {
        match self {
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

/// Follow-up suggested to whoever consumes the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    Block,
    Notify,
    Log,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub identifier: String,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub observed_count: u64,
    pub threshold: u64,
    pub severity: Severity,
    pub actions: Vec<AlertAction>,
    /// Raised for continued traffic while already blocked
    pub persistent: bool,
    /// Flagged by the configured reputation check
    pub suspicious: bool,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Port for an external reputation / threat-intelligence lookup.
///
/// Consulted only when an alert is raised, never for the admission
/// decision itself.
pub trait ReputationCheck: Send + Sync {
    fn is_suspicious(&self, identifier: &str) -> bool;
}

fn actions_for(severity: Severity) -> Vec<AlertAction> {
    match severity {
        Severity::Medium => vec![AlertAction::Log, AlertAction::Notify],
        Severity::High => vec![AlertAction::Block, AlertAction::Notify],
        Severity::Critical => vec![
            AlertAction::Block,
            AlertAction::Notify,
            AlertAction::Escalate,
        ],
    }
}

/// Creates, stores and publishes alerts.
pub struct AlertEmitter {
    alerts: RwLock<VecDeque<Alert>>,
    max_alerts: usize,
    reputation: RwLock<Option<Arc<dyn ReputationCheck>>>,
    events: Arc<EventBus>,
}

impl AlertEmitter {
    pub fn new(max_alerts: usize, events: Arc<EventBus>) -> Self {
        Self {
            alerts: RwLock::new(VecDeque::new()),
            max_alerts,
            reputation: RwLock::new(None),
            events,
        }
    }

    pub fn set_reputation(&self, check: Arc<dyn ReputationCheck>) {
        *self.reputation.write() = Some(check);
    }

    /// Build an alert for `identifier` breaching `rule`, store it and publish it.
    pub fn create_alert(
        &self,
        identifier: &str,
        rule: &Rule,
        observed_count: u64,
        persistent: bool,
        now: DateTime<Utc>,
    ) -> Alert {
        let mut severity = Severity::from_overage(observed_count, rule.limit);
        let suspicious = self
            .reputation
            .read()
            .as_ref()
            .is_some_and(|check| check.is_suspicious(identifier));
        if suspicious {
            severity = severity.raised();
        }

        let mut actions = actions_for(severity);
        if (persistent || suspicious) && !actions.contains(&AlertAction::Escalate) {
            actions.push(AlertAction::Escalate);
        }

        let alert = Alert {
            id: AlertId::new(),
            identifier: identifier.to_string(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            observed_count,
            threshold: rule.limit,
            severity,
            actions,
            persistent,
            suspicious,
            created_at: now,
            acknowledged: false,
        };

        if severity >= Severity::High {
            warn!(
                alert_id = %alert.id,
                identifier = %identifier,
                rule_id = %rule.id,
                observed = observed_count,
                threshold = rule.limit,
                severity = ?severity,
                persistent,
                "Rate limit alert raised"
            );
        } else {
            info!(
                alert_id = %alert.id,
                identifier = %identifier,
                rule_id = %rule.id,
                observed = observed_count,
                threshold = rule.limit,
                "Rate limit alert raised"
            );
        }

        {
            let mut alerts = self.alerts.write();
            if self.max_alerts > 0 {
                while alerts.len() >= self.max_alerts {
                    alerts.pop_front();
                }
                alerts.push_back(alert.clone());
            }
        }

        self.events.publish(EngineEvent::AlertRaised(alert.clone()));
        alert
    }

    /// All retained alerts, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().iter().cloned().collect()
    }

    pub fn get(&self, id: AlertId) -> Result<Alert> {
        self.alerts
            .read()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(TurnstileError::AlertNotFound(id))
    }

    pub fn acknowledge(&self, id: AlertId, now: DateTime<Utc>) -> Result<Alert> {
        let alert = {
            let mut alerts = self.alerts.write();
            let alert = alerts
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or(TurnstileError::AlertNotFound(id))?;
            alert.acknowledged = true;
            alert.clone()
        };
        self.events
            .publish(EngineEvent::AlertAcknowledged { alert_id: id, at: now });
        Ok(alert)
    }

    /// Drop alerts created at or before `cutoff`.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.created_at > cutoff);
        before - alerts.len()
    }

    pub fn clear(&self) {
        self.alerts.write().clear();
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
