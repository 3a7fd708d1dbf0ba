//! Admission controller: the engine object callers hold.
//!
//! # Fail-open policy
//!
//! [`AdmissionController::check_request`] never fails. A request that no
//! active rule matches is admitted, and so is a request whose evaluation hits
//! an internal fault (for example a rule window too large to add to a
//! timestamp). Availability is favoured over strict enforcement: a fault in
//! the limiter must not take down every endpoint behind it. The trade-off is
//! that a misconfigured or faulty engine stops limiting; such decisions carry
//! [`DecisionReason::FailOpen`], are logged at `warn`, and are counted in
//! [`StatsSnapshot::fail_open`] so they can be alerted on.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, trace, warn};

use super::audit::{AuditLog, RequestRecord};
use super::backend::RuleRepository;
use super::counter::{shift_back, shift_forward, until, BucketState, Transition};
use super::decision::{AdmissionRequest, Decision, DecisionReason};
use super::lists::{IdentifierList, ListEntry, ListKind};
use super::registry::BucketRegistry;
use super::rules::{Rule, RuleDefaults, RuleDraft, RuleId, RulePatch, RuleSet, RuleStore, Scope};
use crate::clock::{Clock, SystemClock};
use crate::config::{StorageBackend, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::janitor::SweepReport;
use crate::monitor::{
    spawn_alert_forwarder, Alert, AlertEmitter, AlertId, AlertSink, EngineEvent, EngineStats,
    EventBus, EventKind, ReputationCheck, StatsSnapshot, SubscriptionId,
};

/// Identifiers tracked for the top-blocked statistics between sweeps.
const MAX_TRACKED_OFFENDERS: usize = 10_000;

/// The admission-control engine.
///
/// Construct one per independent policy domain; instances share nothing.
/// All methods take `&self` and the controller is meant to be shared behind
/// an `Arc`.
pub struct AdmissionController {
    config: TurnstileConfig,
    clock: Arc<dyn Clock>,
    rules: RuleStore,
    registry: BucketRegistry,
    allowlist: IdentifierList,
    denylist: IdentifierList,
    audit: AuditLog,
    events: Arc<EventBus>,
    alerts: AlertEmitter,
    stats: EngineStats,
}

impl AdmissionController {
    /// Create a controller using the system clock.
    pub fn new(config: TurnstileConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a controller with an explicit time source.
    pub fn with_clock(config: TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let controller = Self {
            rules: RuleStore::new(RuleDefaults::from(&config.limits)),
            registry: BucketRegistry::new(),
            allowlist: IdentifierList::new(ListKind::Allow),
            denylist: IdentifierList::new(ListKind::Deny),
            audit: AuditLog::new(config.audit.capacity),
            alerts: AlertEmitter::new(config.alerts.max_alerts, Arc::clone(&events)),
            events,
            stats: EngineStats::new(),
            clock,
            config,
        };

        info!(
            enabled = controller.config.enabled,
            storage = ?controller.config.storage.backend,
            "Admission controller initialized"
        );
        Ok(controller)
    }

    /// Attach an external reputation check consulted when alerts are raised.
    pub fn with_reputation(self, check: Arc<dyn ReputationCheck>) -> Self {
        self.alerts.set_reputation(check);
        self
    }

    pub fn config(&self) -> &TurnstileConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---------------------------------------------------------------------
    // Hot path
    // ---------------------------------------------------------------------

    /// Decide whether a request is admitted.
    ///
    /// Always returns a decision; see the module docs for the fail-open policy.
    pub fn check_request(&self, request: &AdmissionRequest) -> Decision {
        let now = self.clock.now();

        let decision = if !self.config.enabled {
            Decision::unlimited(DecisionReason::Disabled, now)
        } else {
            match self.evaluate(request, now) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(
                        identifier = %request.identifier,
                        scope = %request.scope,
                        error = %e,
                        "Admission check failed; failing open"
                    );
                    Decision::unlimited(DecisionReason::FailOpen, now)
                }
            }
        };

        trace!(
            identifier = %request.identifier,
            scope = %request.scope,
            allowed = decision.allowed,
            reason = ?decision.reason,
            remaining = decision.remaining,
            "Admission decision"
        );

        self.stats.record(&request.identifier, &decision, now);
        self.audit.append(RequestRecord::from_decision(
            &request.identifier,
            now,
            &decision,
            &request.metadata,
        ));
        decision
    }

    fn evaluate(&self, request: &AdmissionRequest, now: DateTime<Utc>) -> Result<Decision> {
        if self.config.lists.enable_denylist {
            if let Some(entry) = self.denylist.lookup_any(request.list_subjects(), now) {
                warn!(
                    identifier = %request.identifier,
                    listed = %entry.identifier,
                    "Denylisted identifier rejected"
                );
                return Ok(Decision {
                    allowed: false,
                    remaining: 0,
                    reset_time: entry.expires_at.unwrap_or(now),
                    retry_after: entry.expires_at.map(|expiry| until(expiry, now)),
                    blocked: true,
                    block_expiry: entry.expires_at,
                    rule_id: None,
                    reason: DecisionReason::Denylisted,
                });
            }
        }

        if self.config.lists.enable_allowlist
            && self
                .allowlist
                .lookup_any(request.list_subjects(), now)
                .is_some()
        {
            return Ok(Decision::unlimited(DecisionReason::Allowlisted, now));
        }

        let Some(rule) = self.rules.resolve(request.scope, request.match_subject()) else {
            return Ok(Decision::unlimited(DecisionReason::NoMatchingRule, now));
        };

        let threshold = rule
            .limit
            .saturating_mul(self.config.alerts.persistent_violation_factor);
        let evaluation = self
            .registry
            .evaluate(&rule, &request.identifier, now, threshold)?;

        match evaluation.transition {
            Some(Transition::Blocked { observed }) => {
                debug!(
                    identifier = %request.identifier,
                    rule_id = %rule.id,
                    limit = rule.limit,
                    "Rate limit exceeded; identifier blocked"
                );
                if let Some(block_expiry) = evaluation.block_expiry {
                    self.events.publish(EngineEvent::IdentifierBlocked {
                        rule_id: rule.id,
                        identifier: request.identifier.clone(),
                        block_expiry,
                        at: now,
                    });
                }
                self.alerts
                    .create_alert(&request.identifier, &rule, observed, false, now);
            }
            Some(Transition::PersistentViolation { observed }) => {
                self.alerts
                    .create_alert(&request.identifier, &rule, observed, true, now);
            }
            None => {}
        }

        let reason = if evaluation.allowed {
            DecisionReason::WithinLimit
        } else if evaluation.short_circuited {
            DecisionReason::StillBlocked
        } else {
            DecisionReason::LimitExceeded
        };

        Ok(Decision {
            allowed: evaluation.allowed,
            remaining: evaluation.remaining,
            reset_time: evaluation.reset_time,
            retry_after: evaluation.retry_after,
            blocked: evaluation.blocked,
            block_expiry: evaluation.block_expiry,
            rule_id: Some(rule.id),
            reason,
        })
    }

    // ---------------------------------------------------------------------
    // Rule management
    // ---------------------------------------------------------------------

    pub fn create_rule(&self, draft: RuleDraft) -> Result<Arc<Rule>> {
        self.rules.create(draft, self.clock.now())
    }

    pub fn update_rule(&self, id: RuleId, patch: RulePatch) -> Result<Arc<Rule>> {
        self.rules.update(id, patch, self.clock.now())
    }

    pub fn activate_rule(&self, id: RuleId) -> Result<Arc<Rule>> {
        self.rules.set_active(id, true, self.clock.now())
    }

    pub fn deactivate_rule(&self, id: RuleId) -> Result<Arc<Rule>> {
        self.rules.set_active(id, false, self.clock.now())
    }

    /// Delete a rule together with its buckets.
    pub fn delete_rule(&self, id: RuleId) -> Result<Arc<Rule>> {
        let rule = self.rules.delete(id)?;
        let buckets = self.registry.remove_rule(id);
        debug!(rule_id = %id, buckets, "Removed buckets of deleted rule");
        Ok(rule)
    }

    pub fn get_rule(&self, id: RuleId) -> Result<Arc<Rule>> {
        self.rules.get(id).ok_or(TurnstileError::RuleNotFound(id))
    }

    /// All rules, highest priority first.
    pub fn list_rules(&self) -> Vec<Arc<Rule>> {
        self.rules.list()
    }

    /// Active rules of one scope in resolution order.
    pub fn rules_for_scope(&self, scope: Scope) -> Vec<Arc<Rule>> {
        self.rules.active_for_scope(scope)
    }

    /// Create every rule in a set. Stops at the first invalid draft.
    pub fn load_rule_set(&self, set: RuleSet) -> Result<Vec<Arc<Rule>>> {
        set.rules
            .into_iter()
            .map(|draft| self.create_rule(draft))
            .collect()
    }

    /// Replace in-memory rules with the repository's contents.
    ///
    /// The table is swapped in one step. Buckets survive for every rule id
    /// present in the repository, so running blocks keep their expiry.
    pub async fn restore_rules(&self, repo: &dyn RuleRepository) -> Result<usize> {
        self.require_external_storage()?;
        let rules = repo.load_rules().await?;
        let count = rules.len();
        let removed = self.rules.replace_all(rules);
        for id in &removed {
            self.registry.remove_rule(*id);
        }
        info!(count, removed = removed.len(), "Rules restored from repository");
        Ok(count)
    }

    /// Make the repository mirror the in-memory rule table.
    pub async fn persist_rules(&self, repo: &dyn RuleRepository) -> Result<usize> {
        self.require_external_storage()?;
        let current = self.rules.list();
        for stored in repo.load_rules().await? {
            if self.rules.get(stored.id).is_none() {
                repo.delete_rule(stored.id).await?;
            }
        }
        for rule in &current {
            repo.save_rule(rule).await?;
        }
        info!(count = current.len(), "Rules persisted to repository");
        Ok(current.len())
    }

    fn require_external_storage(&self) -> Result<()> {
        match self.config.storage.backend {
            StorageBackend::External => Ok(()),
            StorageBackend::Memory => Err(TurnstileError::Configuration(
                "rule repository requires storage backend 'external'".to_string(),
            )),
        }
    }

    // ---------------------------------------------------------------------
    // Allow / deny lists
    // ---------------------------------------------------------------------

    pub fn add_to_allowlist(&self, identifier: impl Into<String>) {
        self.allowlist.insert(ListEntry {
            identifier: identifier.into(),
            added_at: self.clock.now(),
            expires_at: None,
            reason: None,
        });
    }

    pub fn remove_from_allowlist(&self, identifier: &str) -> bool {
        self.allowlist.remove(identifier).is_some()
    }

    /// Deny an identifier, permanently or for `duration`.
    pub fn add_to_denylist(
        &self,
        identifier: impl Into<String>,
        duration: Option<Duration>,
    ) -> Result<()> {
        self.add_to_denylist_with_reason(identifier, duration, None)
    }

    pub fn add_to_denylist_with_reason(
        &self,
        identifier: impl Into<String>,
        duration: Option<Duration>,
        reason: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now();
        let expires_at = duration.map(|d| shift_forward(now, d)).transpose()?;
        self.denylist.insert(ListEntry {
            identifier: identifier.into(),
            added_at: now,
            expires_at,
            reason,
        });
        Ok(())
    }

    pub fn remove_from_denylist(&self, identifier: &str) -> bool {
        self.denylist.remove(identifier).is_some()
    }

    pub fn is_allowlisted(&self, identifier: &str) -> bool {
        self.allowlist.contains(identifier, self.clock.now())
    }

    pub fn is_denylisted(&self, identifier: &str) -> bool {
        self.denylist.contains(identifier, self.clock.now())
    }

    pub fn allowlist(&self) -> Vec<ListEntry> {
        self.allowlist.snapshot(self.clock.now())
    }

    pub fn denylist(&self) -> Vec<ListEntry> {
        self.denylist.snapshot(self.clock.now())
    }

    // ---------------------------------------------------------------------
    // Observability
    // ---------------------------------------------------------------------

    pub fn get_stats(&self) -> StatsSnapshot {
        let now = self.clock.now();
        self.stats
            .snapshot(self.registry.len(), self.registry.blocked_count(now))
    }

    pub fn get_alerts(&self) -> Vec<Alert> {
        self.alerts.alerts()
    }

    pub fn get_alert(&self, id: AlertId) -> Result<Alert> {
        self.alerts.get(id)
    }

    pub fn acknowledge_alert(&self, id: AlertId) -> Result<Alert> {
        self.alerts.acknowledge(id, self.clock.now())
    }

    pub fn clear_alerts(&self) {
        self.alerts.clear();
    }

    /// Register a synchronous handler for one kind of engine event.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Stream of engine events for async consumers.
    pub fn event_stream(&self) -> BroadcastStream<EngineEvent> {
        self.events.stream()
    }

    /// Forward raised alerts to an external sink on a background task.
    pub fn spawn_alert_forwarder(&self, sink: Arc<dyn AlertSink>) -> JoinHandle<()> {
        spawn_alert_forwarder(&self.events, sink)
    }

    /// Most recent audit records, newest first.
    pub fn recent_records(&self, limit: usize) -> Vec<RequestRecord> {
        self.audit.recent(limit)
    }

    pub fn bucket_state(&self, rule_id: RuleId, identifier: &str) -> BucketState {
        self.registry.state(rule_id, identifier, self.clock.now())
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Run one cleanup pass over records, buckets, alerts and list entries.
    ///
    /// Buckets still inside their block period are always kept.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let janitor = &self.config.janitor;

        let records_removed = shift_back(now, janitor.record_retention())
            .map(|cutoff| self.audit.prune_before(cutoff))
            .unwrap_or(0);
        let alerts_removed = shift_back(now, janitor.alert_retention())
            .map(|cutoff| self.alerts.purge_before(cutoff))
            .unwrap_or(0);
        let buckets_removed = self.registry.sweep_idle(now, &self.rules.windows());
        let deny_entries_removed = self.denylist.purge_expired(now);
        self.allowlist.purge_expired(now);
        self.stats.trim(MAX_TRACKED_OFFENDERS);

        SweepReport {
            records_removed,
            buckets_removed,
            alerts_removed,
            deny_entries_removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::monitor::Severity;
    use crate::ratelimit::backend::MemoryRuleRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller() -> (AdmissionController, MockClock) {
        controller_with(TurnstileConfig::default())
    }

    fn controller_with(config: TurnstileConfig) -> (AdmissionController, MockClock) {
        let clock = MockClock::at_epoch();
        let controller = AdmissionController::with_clock(config, Arc::new(clock.clone())).unwrap();
        (controller, clock)
    }

    fn auth_rule() -> RuleDraft {
        RuleDraft::new("auth", Scope::Endpoint, "/api/auth/*")
            .limit(5)
            .window(Duration::from_secs(60))
            .block_duration(Duration::from_secs(300))
    }

    fn login_from(ip: &str) -> AdmissionRequest {
        AdmissionRequest::new(ip, Scope::Endpoint)
            .with_endpoint("/api/auth/login")
            .with_ip(ip)
    }

    #[test]
    fn test_no_rule_fails_open() {
        let (controller, _) = controller();
        let decision = controller.check_request(&AdmissionRequest::new("anyone", Scope::User));

        assert!(decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(decision.remaining, crate::ratelimit::UNLIMITED_REMAINING);
        assert_eq!(decision.reason, DecisionReason::NoMatchingRule);
        assert_eq!(decision.rule_id, None);
    }

    #[test]
    fn test_auth_endpoint_scenario() {
        let (controller, clock) = controller();
        let rule = controller.create_rule(auth_rule()).unwrap();

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = controller.check_request(&login_from("198.51.100.4"));
            assert!(decision.allowed);
            assert_eq!(decision.rule_id, Some(rule.id));
            remaining.push(decision.remaining);
            clock.advance(Duration::from_secs(2));
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let sixth = controller.check_request(&login_from("198.51.100.4"));
        assert!(!sixth.allowed);
        assert!(sixth.blocked);
        assert_eq!(sixth.reason, DecisionReason::LimitExceeded);
        assert!(sixth.retry_after.unwrap() > Duration::ZERO);

        // A different IP has its own bucket.
        assert!(controller.check_request(&login_from("198.51.100.5")).allowed);
    }

    #[test]
    fn test_block_lasts_exactly_block_duration() {
        let (controller, clock) = controller();
        controller
            .create_rule(
                RuleDraft::new("tight", Scope::Ip, "*")
                    .limit(1)
                    .window(Duration::from_secs(1))
                    .block_duration(Duration::from_secs(10)),
            )
            .unwrap();
        let request = AdmissionRequest::new("203.0.113.1", Scope::Ip).with_ip("203.0.113.1");

        assert!(controller.check_request(&request).allowed);
        let blocked = controller.check_request(&request);
        let expiry = blocked.block_expiry.unwrap();
        assert_eq!(expiry, controller.now() + chrono::Duration::seconds(10));

        clock.advance(Duration::from_secs(5));
        let still = controller.check_request(&request);
        assert_eq!(still.reason, DecisionReason::StillBlocked);
        assert_eq!(still.block_expiry, Some(expiry));
        assert_eq!(still.retry_after, Some(Duration::from_secs(5)));

        clock.advance(Duration::from_millis(4999));
        assert!(controller.check_request(&request).blocked);

        clock.advance(Duration::from_millis(1));
        let after = controller.check_request(&request);
        assert!(after.allowed);
        assert_eq!(after.reason, DecisionReason::WithinLimit);
    }

    #[test]
    fn test_allowlist_overrides_rule() {
        let (controller, _) = controller();
        controller.create_rule(auth_rule()).unwrap();
        controller.add_to_allowlist("10.0.0.8");

        for _ in 0..20 {
            let decision = controller.check_request(&login_from("10.0.0.8"));
            assert!(decision.allowed);
            assert_eq!(decision.reason, DecisionReason::Allowlisted);
        }

        assert!(controller.remove_from_allowlist("10.0.0.8"));
        assert!(!controller.is_allowlisted("10.0.0.8"));
    }

    #[test]
    fn test_denylist_with_duration_expires() {
        let (controller, clock) = controller();
        controller
            .add_to_denylist("bad-actor", Some(Duration::from_millis(1000)))
            .unwrap();
        let request = AdmissionRequest::new("bad-actor", Scope::User);

        let denied = controller.check_request(&request);
        assert!(!denied.allowed);
        assert!(denied.blocked);
        assert_eq!(denied.reason, DecisionReason::Denylisted);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(1000)));

        clock.advance(Duration::from_millis(1500));
        let later = controller.check_request(&request);
        assert!(later.allowed);
        assert_eq!(later.reason, DecisionReason::NoMatchingRule);
    }

    #[test]
    fn test_denylist_permanent_beats_allowlist() {
        let (controller, clock) = controller();
        controller.add_to_allowlist("user-1");
        controller.add_to_denylist("user-1", None).unwrap();

        clock.advance(Duration::from_secs(86_400 * 365));
        let decision = controller.check_request(&AdmissionRequest::new("user-1", Scope::User));
        assert!(decision.blocked);
        assert_eq!(decision.retry_after, None);
        assert_eq!(decision.block_expiry, None);

        assert!(controller.remove_from_denylist("user-1"));
        let decision = controller.check_request(&AdmissionRequest::new("user-1", Scope::User));
        assert_eq!(decision.reason, DecisionReason::Allowlisted);
    }

    #[test]
    fn test_lists_checked_against_ip_subject() {
        let (controller, _) = controller();
        controller.add_to_denylist("192.0.2.66", None).unwrap();

        let request = AdmissionRequest::new("session-abc", Scope::Endpoint)
            .with_endpoint("/home")
            .with_ip("192.0.2.66");
        assert_eq!(
            controller.check_request(&request).reason,
            DecisionReason::Denylisted
        );
    }

    #[test]
    fn test_disabled_lists_are_ignored() {
        let mut config = TurnstileConfig::default();
        config.lists.enable_denylist = false;
        let (controller, _) = controller_with(config);
        controller.add_to_denylist("x", None).unwrap();

        let decision = controller.check_request(&AdmissionRequest::new("x", Scope::Global));
        assert!(decision.allowed);
    }

    #[test]
    fn test_higher_priority_rule_enforced() {
        let (controller, _) = controller();
        controller
            .create_rule(
                RuleDraft::new("broad", Scope::Endpoint, "/api/*")
                    .limit(100)
                    .priority(1),
            )
            .unwrap();
        let strict = controller
            .create_rule(
                RuleDraft::new("strict", Scope::Endpoint, "/api/auth/*")
                    .limit(1)
                    .priority(50),
            )
            .unwrap();

        let first = controller.check_request(&login_from("1.1.1.1"));
        assert_eq!(first.rule_id, Some(strict.id));
        assert_eq!(first.remaining, 0);
        assert!(!controller.check_request(&login_from("1.1.1.1")).allowed);
    }

    #[test]
    fn test_delete_rule_keeps_unrelated_buckets() {
        let (controller, _) = controller();
        let keep = controller
            .create_rule(RuleDraft::new("users", Scope::User, "*").limit(10))
            .unwrap();
        let temp = controller.create_rule(auth_rule()).unwrap();

        controller.check_request(&AdmissionRequest::new("alice", Scope::User).with_user("alice"));
        controller.check_request(&login_from("1.1.1.1"));
        assert!(controller
            .list_rules()
            .iter()
            .any(|r| r.id == temp.id));

        controller.delete_rule(temp.id).unwrap();
        assert!(controller.list_rules().iter().all(|r| r.id != temp.id));
        assert!(matches!(
            controller.get_rule(temp.id),
            Err(TurnstileError::RuleNotFound(_))
        ));
        assert_eq!(controller.bucket_state(temp.id, "1.1.1.1"), BucketState::Fresh);
        assert_eq!(controller.bucket_state(keep.id, "alice"), BucketState::Active);

        let next =
            controller.check_request(&AdmissionRequest::new("alice", Scope::User).with_user("alice"));
        assert_eq!(next.remaining, 8);
    }

    #[test]
    fn test_deactivated_rule_not_enforced() {
        let (controller, _) = controller();
        let rule = controller
            .create_rule(RuleDraft::new("one", Scope::Global, "*").limit(1))
            .unwrap();
        let request = AdmissionRequest::new("g", Scope::Global);
        controller.check_request(&request);
        assert!(!controller.check_request(&request).allowed);

        controller.deactivate_rule(rule.id).unwrap();
        assert_eq!(
            controller.check_request(&request).reason,
            DecisionReason::NoMatchingRule
        );

        controller.activate_rule(rule.id).unwrap();
        assert!(controller.check_request(&request).blocked);
    }

    #[test]
    fn test_disabled_engine_admits_everything() {
        let config = TurnstileConfig {
            enabled: false,
            ..Default::default()
        };
        let (controller, _) = controller_with(config);
        controller
            .create_rule(RuleDraft::new("one", Scope::Global, "*").limit(1))
            .unwrap();

        for _ in 0..3 {
            let decision = controller.check_request(&AdmissionRequest::new("g", Scope::Global));
            assert!(decision.allowed);
            assert_eq!(decision.reason, DecisionReason::Disabled);
        }
    }

    #[test]
    fn test_internal_fault_fails_open() {
        let (controller, _) = controller();
        controller
            .create_rule(
                RuleDraft::new("huge", Scope::Global, "*")
                    .limit(1)
                    .window(Duration::from_secs(u64::MAX)),
            )
            .unwrap();

        let decision = controller.check_request(&AdmissionRequest::new("g", Scope::Global));
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::FailOpen);
        assert_eq!(controller.get_stats().fail_open, 1);
    }

    #[test]
    fn test_block_raises_alert_and_event() {
        let (controller, _) = controller();
        let rule = controller
            .create_rule(
                RuleDraft::new("one", Scope::Global, "*")
                    .limit(2)
                    .block_duration(Duration::from_secs(60)),
            )
            .unwrap();
        let blocked_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&blocked_events);
        controller.subscribe(EventKind::IdentifierBlocked, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let request = AdmissionRequest::new("g", Scope::Global);
        for _ in 0..3 {
            controller.check_request(&request);
        }

        assert_eq!(blocked_events.load(Ordering::SeqCst), 1);
        let alerts = controller.get_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, rule.id);
        assert_eq!(alerts[0].observed_count, 3);
        assert_eq!(alerts[0].threshold, 2);
        assert_eq!(alerts[0].severity, Severity::Medium);

        // Continued traffic while blocked: 2 + 1 + denied must exceed 2 * 2.
        controller.check_request(&request);
        assert_eq!(controller.get_alerts().len(), 1);
        controller.check_request(&request);
        let alerts = controller.get_alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[1].persistent);

        let acked = controller.acknowledge_alert(alerts[0].id).unwrap();
        assert!(acked.acknowledged);
        assert!(matches!(
            controller.acknowledge_alert(AlertId::new()),
            Err(TurnstileError::AlertNotFound(_))
        ));
    }

    #[test]
    fn test_stats_and_audit() {
        let (controller, _) = controller();
        controller
            .create_rule(RuleDraft::new("one", Scope::Global, "*").limit(1))
            .unwrap();
        controller.add_to_allowlist("vip");

        let request = AdmissionRequest::new("g", Scope::Global).with_metadata("request_id", "r-1");
        controller.check_request(&request);
        controller.check_request(&request);
        controller.check_request(&AdmissionRequest::new("vip", Scope::Global));

        let stats = controller.get_stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.allowlist_hits, 1);
        assert_eq!(stats.blocked_buckets, 1);
        assert_eq!(stats.top_blocked_identifiers[0].key, "g");
        assert_eq!(stats.peak_requests_per_second, 3);

        let records = controller.recent_records(10);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].identifier, "vip");
        assert!(!records[1].allowed);
        assert_eq!(records[2].metadata.get("request_id").map(String::as_str), Some("r-1"));
    }

    #[test]
    fn test_update_rule_applies_to_existing_bucket() {
        let (controller, _) = controller();
        let rule = controller
            .create_rule(RuleDraft::new("r", Scope::Global, "*").limit(10))
            .unwrap();
        let request = AdmissionRequest::new("g", Scope::Global);
        controller.check_request(&request);
        controller.check_request(&request);

        controller
            .update_rule(
                rule.id,
                RulePatch {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!controller.check_request(&request).allowed);
    }

    #[test]
    fn test_load_rule_set() {
        let (controller, _) = controller();
        let set = RuleSet::from_yaml(
            r#"
rules:
  - name: ip
    scope: ip
    pattern: "192.168.1.*"
    limit: 3
  - name: bad
    scope: global
    limit: 0
"#,
        )
        .unwrap();
        assert!(controller.load_rule_set(set).is_err());
        assert_eq!(controller.list_rules().len(), 1);
        assert_eq!(controller.rules_for_scope(Scope::Ip).len(), 1);
    }

    #[tokio::test]
    async fn test_restore_and_persist_rules() {
        let mut config = TurnstileConfig::default();
        config.storage.backend = StorageBackend::External;
        let (source, _) = controller_with(config.clone());
        let repo = MemoryRuleRepository::new();

        let rule = source.create_rule(auth_rule()).unwrap();
        assert_eq!(source.persist_rules(&repo).await.unwrap(), 1);

        let (replica, _) = controller_with(config);
        replica
            .create_rule(RuleDraft::new("stale", Scope::Global, "*"))
            .unwrap();
        assert_eq!(replica.restore_rules(&repo).await.unwrap(), 1);
        let rules = replica.list_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, rule.id);

        source.delete_rule(rule.id).unwrap();
        source.persist_rules(&repo).await.unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_block_survives_persist_and_restore() {
        let mut config = TurnstileConfig::default();
        config.storage.backend = StorageBackend::External;
        let (controller, clock) = controller_with(config);
        let repo = MemoryRuleRepository::new();
        let rule = controller
            .create_rule(
                RuleDraft::new("one", Scope::Global, "*")
                    .limit(1)
                    .block_duration(Duration::from_secs(600)),
            )
            .unwrap();
        let request = AdmissionRequest::new("g", Scope::Global);
        controller.check_request(&request);
        let blocked = controller.check_request(&request);
        assert!(blocked.blocked);

        controller.persist_rules(&repo).await.unwrap();
        controller.restore_rules(&repo).await.unwrap();

        assert_eq!(controller.bucket_state(rule.id, "g"), BucketState::Blocked);
        clock.advance(Duration::from_secs(300));
        let still = controller.check_request(&request);
        assert!(!still.allowed);
        assert_eq!(still.block_expiry, blocked.block_expiry);
    }

    #[tokio::test]
    async fn test_restore_drops_buckets_of_missing_rules() {
        let mut config = TurnstileConfig::default();
        config.storage.backend = StorageBackend::External;
        let (controller, _) = controller_with(config);
        let repo = MemoryRuleRepository::new();
        let stale = controller
            .create_rule(RuleDraft::new("stale", Scope::Global, "*").limit(5))
            .unwrap();
        controller.check_request(&AdmissionRequest::new("g", Scope::Global));
        assert_eq!(controller.bucket_state(stale.id, "g"), BucketState::Active);

        assert_eq!(controller.restore_rules(&repo).await.unwrap(), 0);
        assert!(controller.list_rules().is_empty());
        assert_eq!(controller.bucket_state(stale.id, "g"), BucketState::Fresh);
    }

    #[test]
    fn test_sweep_after_window_widened_keeps_bucket() {
        let (controller, clock) = controller();
        let rule = controller
            .create_rule(
                RuleDraft::new("r", Scope::Global, "*")
                    .limit(2)
                    .window(Duration::from_secs(10)),
            )
            .unwrap();
        let request = AdmissionRequest::new("g", Scope::Global);
        assert!(controller.check_request(&request).allowed);
        assert!(controller.check_request(&request).allowed);

        controller
            .update_rule(
                rule.id,
                RulePatch {
                    window: Some(Duration::from_secs(100)),
                    ..Default::default()
                },
            )
            .unwrap();
        clock.advance(Duration::from_secs(20));

        assert_eq!(controller.sweep().buckets_removed, 0);
        assert!(!controller.check_request(&request).allowed);
    }

    #[tokio::test]
    async fn test_repository_requires_external_backend() {
        let (controller, _) = controller();
        let repo = MemoryRuleRepository::new();
        assert!(matches!(
            controller.restore_rules(&repo).await,
            Err(TurnstileError::Configuration(_))
        ));
    }
}
