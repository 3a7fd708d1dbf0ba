//! External rule storage port.
//!
//! The engine keeps its working rule table in memory. When the storage
//! backend is `external`, rules are restored from and persisted to a
//! [`RuleRepository`] off the hot path; admission checks never touch it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::rules::{Rule, RuleId};
use crate::error::Result;

/// Trait for durable rule storage implementations.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Load every stored rule.
    async fn load_rules(&self) -> Result<Vec<Rule>>;

    /// Insert or replace a rule.
    async fn save_rule(&self, rule: &Rule) -> Result<()>;

    /// Remove a rule; removing an unknown id is not an error.
    async fn delete_rule(&self, id: RuleId) -> Result<()>;
}

/// In-process repository, useful for tests and single-node setups.
#[derive(Debug, Default)]
pub struct MemoryRuleRepository {
    rules: RwLock<HashMap<RuleId, Rule>>,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn load_rules(&self) -> Result<Vec<Rule>> {
        let mut rules: Vec<Rule> = self.rules.read().values().cloned().collect();
        rules.sort_by_key(|r| (r.created_at, r.id));
        Ok(rules)
    }

    async fn save_rule(&self, rule: &Rule) -> Result<()> {
        self.rules.write().insert(rule.id, rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, id: RuleId) -> Result<()> {
        self.rules.write().remove(&id);
        Ok(())
    }
}
