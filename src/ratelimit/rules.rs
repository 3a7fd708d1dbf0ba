//! Rate limit rule definitions, storage and resolution.
//!
//! Rules are immutable once published: an update builds a new [`Rule`] and
//! swaps it into the table, so a check that already resolved a rule keeps
//! a consistent view of it for the rest of the evaluation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::pattern::Pattern;
use crate::config::{duration_ms, LimitsConfig};
use crate::error::{Result, TurnstileError};

/// Unique identifier of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RuleId {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TurnstileError::Configuration(format!("invalid rule id '{}': {}", s, e)))
    }
}

/// The dimension a rule is tracked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Ip,
    User,
    Endpoint,
    #[default]
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Endpoint => "endpoint",
            Scope::Global => "global",
        };
        f.write_str(name)
    }
}

/// A validated rate limit rule with its compiled pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RuleRecord", into = "RuleRecord")]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub description: Option<String>,
    pub scope: Scope,
    pub pattern: String,
    /// Requests admitted per window
    pub limit: u64,
    pub window: Duration,
    /// Secondary allowance, informational only
    pub burst: u64,
    pub block_duration: Duration,
    pub active: bool,
    /// Higher wins when several rules match
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    matcher: Pattern,
}

impl Rule {
    /// Whether this rule's pattern matches the given subject.
    pub fn matches(&self, subject: &str) -> bool {
        self.matcher.matches(subject)
    }

    pub fn matcher(&self) -> &Pattern {
        &self.matcher
    }
}

/// Serialized shape of a [`Rule`]; the matcher is rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleRecord {
    id: RuleId,
    name: String,
    #[serde(default)]
    description: Option<String>,
    scope: Scope,
    pattern: String,
    limit: u64,
    #[serde(rename = "window_ms", with = "duration_ms")]
    window: Duration,
    #[serde(default)]
    burst: u64,
    #[serde(rename = "block_duration_ms", with = "duration_ms")]
    block_duration: Duration,
    active: bool,
    priority: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRecord> for Rule {
    type Error = TurnstileError;

    fn try_from(record: RuleRecord) -> Result<Self> {
        validate_limits(record.limit, record.window)?;
        let matcher = Pattern::compile(record.scope, &record.pattern)?;
        Ok(Rule {
            id: record.id,
            name: record.name,
            description: record.description,
            scope: record.scope,
            pattern: record.pattern,
            limit: record.limit,
            window: record.window,
            burst: record.burst,
            block_duration: record.block_duration,
            active: record.active,
            priority: record.priority,
            created_at: record.created_at,
            updated_at: record.updated_at,
            matcher,
        })
    }
}

impl From<Rule> for RuleRecord {
    fn from(rule: Rule) -> Self {
        RuleRecord {
            id: rule.id,
            name: rule.name,
            description: rule.description,
            scope: rule.scope,
            pattern: rule.pattern,
            limit: rule.limit,
            window: rule.window,
            burst: rule.burst,
            block_duration: rule.block_duration,
            active: rule.active,
            priority: rule.priority,
            created_at: rule.created_at,
            updated_at: rule.updated_at,
        }
    }
}

/// Input for creating a rule. Omitted values fall back to [`RuleDefaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default, rename = "window_ms", with = "duration_ms::option")]
    pub window: Option<Duration>,
    #[serde(default)]
    pub burst: Option<u64>,
    #[serde(default, rename = "block_duration_ms", with = "duration_ms::option")]
    pub block_duration: Option<Duration>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub active: Option<bool>,
}

fn default_pattern() -> String {
    "*".to_string()
}

impl RuleDraft {
    pub fn new(name: impl Into<String>, scope: Scope, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope,
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = Some(block_duration);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = Some(false);
        self
    }
}

/// Partial update of a rule. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub scope: Option<Scope>,
    pub pattern: Option<String>,
    pub limit: Option<u64>,
    #[serde(default, rename = "window_ms", with = "duration_ms::option")]
    pub window: Option<Duration>,
    pub burst: Option<u64>,
    #[serde(default, rename = "block_duration_ms", with = "duration_ms::option")]
    pub block_duration: Option<Duration>,
    pub priority: Option<i32>,
    pub active: Option<bool>,
}

/// Values applied to drafts that leave fields unset.
#[derive(Debug, Clone)]
pub struct RuleDefaults {
    pub limit: u64,
    pub window: Duration,
    pub max_burst: u64,
    pub block_duration: Duration,
    pub priority: i32,
}

impl From<&LimitsConfig> for RuleDefaults {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            limit: limits.default_limit,
            window: limits.default_window(),
            max_burst: limits.max_burst,
            block_duration: limits.block_duration(),
            priority: 0,
        }
    }
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

fn validate_limits(limit: u64, window: Duration) -> Result<()> {
    if limit == 0 {
        return Err(TurnstileError::Configuration(
            "rule limit must be greater than 0".to_string(),
        ));
    }
    if window.is_zero() {
        return Err(TurnstileError::Configuration(
            "rule window must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct RuleTable {
    /// All rules in insertion order
    rules: Vec<Arc<Rule>>,
    /// Active rules per scope, highest priority first
    by_scope: HashMap<Scope, Vec<Arc<Rule>>>,
}

impl RuleTable {
    fn position(&self, id: RuleId) -> Option<usize> {
        self.rules.iter().position(|r| r.id == id)
    }

    /// Rebuild the per-scope resolution index.
    ///
    /// The sort is stable, so rules with equal priority keep insertion order
    /// and the earlier rule wins.
    fn reindex(&mut self) {
        let mut by_scope: HashMap<Scope, Vec<Arc<Rule>>> = HashMap::new();
        for rule in self.rules.iter().filter(|r| r.active) {
            by_scope.entry(rule.scope).or_default().push(Arc::clone(rule));
        }
        for rules in by_scope.values_mut() {
            rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        self.by_scope = by_scope;
    }
}

/// Thread-safe store of rule definitions.
pub struct RuleStore {
    table: RwLock<RuleTable>,
    defaults: RuleDefaults,
}

impl RuleStore {
    pub fn new(defaults: RuleDefaults) -> Self {
        Self {
            table: RwLock::new(RuleTable::default()),
            defaults,
        }
    }

    /// Validate a draft, assign an id and add it to the store.
    pub fn create(&self, draft: RuleDraft, now: DateTime<Utc>) -> Result<Arc<Rule>> {
        let limit = draft.limit.unwrap_or(self.defaults.limit);
        let window = draft.window.unwrap_or(self.defaults.window);
        validate_limits(limit, window)?;
        let matcher = Pattern::compile(draft.scope, &draft.pattern)?;

        let rule = Arc::new(Rule {
            id: RuleId::new(),
            name: draft.name,
            description: draft.description,
            scope: draft.scope,
            pattern: draft.pattern.trim().to_string(),
            limit,
            window,
            burst: draft
                .burst
                .unwrap_or(self.defaults.max_burst)
                .min(self.defaults.max_burst),
            block_duration: draft.block_duration.unwrap_or(self.defaults.block_duration),
            active: draft.active.unwrap_or(true),
            priority: draft.priority.unwrap_or(self.defaults.priority),
            created_at: now,
            updated_at: now,
            matcher,
        });

        let mut table = self.table.write();
        table.rules.push(Arc::clone(&rule));
        table.reindex();

        info!(
            rule_id = %rule.id,
            name = %rule.name,
            scope = %rule.scope,
            pattern = %rule.pattern,
            limit = rule.limit,
            window_ms = rule.window.as_millis() as u64,
            priority = rule.priority,
            "Rule created"
        );
        Ok(rule)
    }

    /// Swap the whole rule table for `rules` under a single write lock.
    ///
    /// Returns the ids that were present before and are absent now, so the
    /// caller can drop their buckets. Rules kept by id keep their buckets.
    pub fn replace_all(&self, rules: Vec<Rule>) -> Vec<RuleId> {
        let incoming: HashSet<RuleId> = rules.iter().map(|r| r.id).collect();
        let mut table = self.table.write();
        let removed: Vec<RuleId> = table
            .rules
            .iter()
            .map(|r| r.id)
            .filter(|id| !incoming.contains(id))
            .collect();
        table.rules = rules.into_iter().map(Arc::new).collect();
        table.reindex();
        info!(
            count = table.rules.len(),
            removed = removed.len(),
            "Rule table replaced"
        );
        removed
    }

    /// Current window of every rule, by id.
    pub fn windows(&self) -> HashMap<RuleId, Duration> {
        let table = self.table.read();
        table.rules.iter().map(|r| (r.id, r.window)).collect()
    }

    /// Apply a patch to an existing rule.
    pub fn update(&self, id: RuleId, patch: RulePatch, now: DateTime<Utc>) -> Result<Arc<Rule>> {
        let mut table = self.table.write();
        let pos = table.position(id).ok_or(TurnstileError::RuleNotFound(id))?;
        let mut rule = Rule::clone(&table.rules[pos]);

        let recompile = patch.scope.is_some() || patch.pattern.is_some();
        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(description) = patch.description {
            rule.description = Some(description);
        }
        if let Some(scope) = patch.scope {
            rule.scope = scope;
        }
        if let Some(pattern) = patch.pattern {
            rule.pattern = pattern.trim().to_string();
        }
        if let Some(limit) = patch.limit {
            rule.limit = limit;
        }
        if let Some(window) = patch.window {
            rule.window = window;
        }
        if let Some(burst) = patch.burst {
            rule.burst = burst.min(self.defaults.max_burst);
        }
        if let Some(block_duration) = patch.block_duration {
            rule.block_duration = block_duration;
        }
        if let Some(priority) = patch.priority {
            rule.priority = priority;
        }
        if let Some(active) = patch.active {
            rule.active = active;
        }

        validate_limits(rule.limit, rule.window)?;
        if recompile {
            rule.matcher = Pattern::compile(rule.scope, &rule.pattern)?;
        }
        rule.updated_at = now;

        let rule = Arc::new(rule);
        table.rules[pos] = Arc::clone(&rule);
        table.reindex();

        info!(rule_id = %id, active = rule.active, "Rule updated");
        Ok(rule)
    }

    pub fn set_active(&self, id: RuleId, active: bool, now: DateTime<Utc>) -> Result<Arc<Rule>> {
        self.update(
            id,
            RulePatch {
                active: Some(active),
                ..Default::default()
            },
            now,
        )
    }

    /// Remove a rule, returning it.
    pub fn delete(&self, id: RuleId) -> Result<Arc<Rule>> {
        let mut table = self.table.write();
        let pos = table.position(id).ok_or(TurnstileError::RuleNotFound(id))?;
        let removed = table.rules.remove(pos);
        table.reindex();
        info!(rule_id = %id, name = %removed.name, "Rule deleted");
        Ok(removed)
    }

    pub fn get(&self, id: RuleId) -> Option<Arc<Rule>> {
        let table = self.table.read();
        table.rules.iter().find(|r| r.id == id).cloned()
    }

    /// All rules, highest priority first.
    pub fn list(&self) -> Vec<Arc<Rule>> {
        let table = self.table.read();
        let mut rules = table.rules.clone();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }

    /// Active rules for a scope in resolution order.
    pub fn active_for_scope(&self, scope: Scope) -> Vec<Arc<Rule>> {
        let table = self.table.read();
        table.by_scope.get(&scope).cloned().unwrap_or_default()
    }

    /// Find the highest-priority active rule of `scope` matching `subject`.
    pub fn resolve(&self, scope: Scope, subject: &str) -> Option<Arc<Rule>> {
        let table = self.table.read();
        table
            .by_scope
            .get(&scope)?
            .iter()
            .find(|rule| rule.matches(subject))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(RuleDefaults::default())
    }
}

/// A set of rule drafts loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RuleDraft>,
}

impl RuleSet {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule set");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Configuration(format!("Failed to parse rule set: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn endpoint_rule(name: &str, pattern: &str, priority: i32) -> RuleDraft {
        RuleDraft::new(name, Scope::Endpoint, pattern)
            .limit(10)
            .window(Duration::from_secs(60))
            .priority(priority)
    }

    #[test]
    fn test_create_applies_defaults() {
        let store = RuleStore::default();
        let rule = store
            .create(RuleDraft::new("global", Scope::Global, "*"), now())
            .unwrap();

        assert_eq!(rule.limit, 100);
        assert_eq!(rule.window, Duration::from_secs(60));
        assert_eq!(rule.block_duration, Duration::from_secs(300));
        assert_eq!(rule.priority, 0);
        assert!(rule.active);
        assert_eq!(rule.created_at, rule.updated_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_create_rejects_zero_limit_and_window() {
        let store = RuleStore::default();
        let err = store
            .create(RuleDraft::new("bad", Scope::Global, "*").limit(0), now())
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Configuration(_)));

        let err = store
            .create(
                RuleDraft::new("bad", Scope::Global, "*").window(Duration::ZERO),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Configuration(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_burst_clamped_to_max() {
        let store = RuleStore::default();
        let rule = store
            .create(RuleDraft::new("b", Scope::Global, "*").burst(500), now())
            .unwrap();
        assert_eq!(rule.burst, 10);
    }

    #[test]
    fn test_resolve_prefers_higher_priority() {
        let store = RuleStore::default();
        store.create(endpoint_rule("broad", "/api/*", 1), now()).unwrap();
        let narrow = store
            .create(endpoint_rule("auth", "/api/auth/*", 10), now())
            .unwrap();

        let resolved = store.resolve(Scope::Endpoint, "/api/auth/login").unwrap();
        assert_eq!(resolved.id, narrow.id);

        let resolved = store.resolve(Scope::Endpoint, "/api/users").unwrap();
        assert_eq!(resolved.name, "broad");
    }

    #[test]
    fn test_resolve_equal_priority_keeps_creation_order() {
        let store = RuleStore::default();
        let first = store.create(endpoint_rule("first", "/a/*", 5), now()).unwrap();
        store.create(endpoint_rule("second", "/a/*", 5), now()).unwrap();

        assert_eq!(store.resolve(Scope::Endpoint, "/a/b").unwrap().id, first.id);
    }

    #[test]
    fn test_resolve_ignores_other_scopes_and_inactive() {
        let store = RuleStore::default();
        let rule = store
            .create(endpoint_rule("inactive", "*", 0).inactive(), now())
            .unwrap();
        store
            .create(RuleDraft::new("users", Scope::User, "*"), now())
            .unwrap();

        assert!(store.resolve(Scope::Endpoint, "/x").is_none());

        store.set_active(rule.id, true, now()).unwrap();
        assert_eq!(store.resolve(Scope::Endpoint, "/x").unwrap().id, rule.id);

        store.set_active(rule.id, false, now()).unwrap();
        assert!(store.resolve(Scope::Endpoint, "/x").is_none());
    }

    #[test]
    fn test_update_recompiles_pattern() {
        let store = RuleStore::default();
        let rule = store.create(endpoint_rule("r", "/old/*", 0), now()).unwrap();
        let later = now() + chrono::Duration::seconds(5);

        let updated = store
            .update(
                rule.id,
                RulePatch {
                    pattern: Some("/new/*".to_string()),
                    limit: Some(3),
                    ..Default::default()
                },
                later,
            )
            .unwrap();

        assert_eq!(updated.limit, 3);
        assert_eq!(updated.updated_at, later);
        assert_eq!(updated.created_at, rule.created_at);
        assert!(store.resolve(Scope::Endpoint, "/old/x").is_none());
        assert!(store.resolve(Scope::Endpoint, "/new/x").is_some());
    }

    #[test]
    fn test_update_validation_leaves_rule_untouched() {
        let store = RuleStore::default();
        let rule = store.create(endpoint_rule("r", "/x", 0), now()).unwrap();

        let err = store
            .update(
                rule.id,
                RulePatch {
                    limit: Some(0),
                    ..Default::default()
                },
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Configuration(_)));
        assert_eq!(store.get(rule.id).unwrap().limit, 10);
    }

    #[test]
    fn test_unknown_rule_not_found() {
        let store = RuleStore::default();
        let id = RuleId::new();
        assert!(matches!(store.delete(id), Err(TurnstileError::RuleNotFound(_))));
        assert!(matches!(
            store.set_active(id, true, now()),
            Err(TurnstileError::RuleNotFound(_))
        ));
    }

    #[test]
    fn test_create_list_delete() {
        let store = RuleStore::default();
        let keep = store.create(endpoint_rule("keep", "/k", 1), now()).unwrap();
        let dropped = store.create(endpoint_rule("drop", "/d", 2), now()).unwrap();

        let listed: Vec<RuleId> = store.list().iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![dropped.id, keep.id]);

        store.delete(dropped.id).unwrap();
        assert!(store.get(dropped.id).is_none());
        assert!(store.get(keep.id).is_some());
        assert!(store.resolve(Scope::Endpoint, "/d").is_none());
    }

    #[test]
    fn test_replace_all_reports_dropped_ids() {
        let store = RuleStore::default();
        let kept = store
            .create(endpoint_rule("kept", "/a", 1), now())
            .unwrap();
        let dropped = store
            .create(endpoint_rule("dropped", "/b", 1), now())
            .unwrap();
        let other = RuleStore::default()
            .create(endpoint_rule("new", "/c", 5), now())
            .unwrap();

        let removed = store.replace_all(vec![Rule::clone(&kept), Rule::clone(&other)]);
        assert_eq!(removed, vec![dropped.id]);
        assert_eq!(store.len(), 2);
        assert!(store.get(dropped.id).is_none());
        assert_eq!(store.resolve(Scope::Endpoint, "/c").unwrap().id, other.id);
        assert_eq!(store.windows().get(&kept.id), Some(&kept.window));
    }

    #[test]
    fn test_rule_serde_rebuilds_matcher() {
        let store = RuleStore::default();
        let rule = store
            .create(
                RuleDraft::new("subnet", Scope::Ip, "10.0.*")
                    .limit(7)
                    .window(Duration::from_millis(1500)),
                now(),
            )
            .unwrap();

        let json = serde_json::to_value(&*rule).unwrap();
        assert_eq!(json["window_ms"], 1500);
        assert!(json.get("matcher").is_none());

        let restored: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(restored.id, rule.id);
        assert!(restored.matches("10.0.4.2"));
        assert!(!restored.matches("10.1.4.2"));
    }

    #[test]
    fn test_parse_rule_set() {
        let yaml = r#"
rules:
  - name: auth
    scope: endpoint
    pattern: "/api/auth/*"
    limit: 5
    window_ms: 60000
    block_duration_ms: 900000
    priority: 10
  - name: everyone
    scope: global
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].scope, Scope::Endpoint);
        assert_eq!(set.rules[0].window, Some(Duration::from_secs(60)));
        assert_eq!(set.rules[0].block_duration, Some(Duration::from_secs(900)));
        assert_eq!(set.rules[1].pattern, "*");
        assert_eq!(set.rules[1].limit, None);
    }
}
