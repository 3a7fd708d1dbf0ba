//! Allow and deny lists that bypass rule evaluation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

/// An identifier on the allow or deny list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub identifier: String,
    pub added_at: DateTime<Utc>,
    /// `None` means the entry stays until removed
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl ListEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Which list an entry lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Allow,
    Deny,
}

impl ListKind {
    fn as_str(&self) -> &'static str {
        match self {
            ListKind::Allow => "allowlist",
            ListKind::Deny => "denylist",
        }
    }
}

/// A concurrent identifier set with optional per-entry expiry.
#[derive(Debug)]
pub struct IdentifierList {
    kind: ListKind,
    entries: DashMap<String, ListEntry>,
}

impl IdentifierList {
    pub fn new(kind: ListKind) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    /// Add or replace an entry.
    pub fn insert(&self, entry: ListEntry) {
        info!(
            list = self.kind.as_str(),
            identifier = %entry.identifier,
            expires_at = ?entry.expires_at,
            "Identifier listed"
        );
        self.entries.insert(entry.identifier.clone(), entry);
    }

    pub fn remove(&self, identifier: &str) -> Option<ListEntry> {
        let removed = self.entries.remove(identifier).map(|(_, entry)| entry);
        if removed.is_some() {
            info!(list = self.kind.as_str(), identifier = %identifier, "Identifier unlisted");
        }
        removed
    }

    /// The live (non-expired) entry for an identifier.
    pub fn lookup(&self, identifier: &str, now: DateTime<Utc>) -> Option<ListEntry> {
        self.entries
            .get(identifier)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identifier: &str, now: DateTime<Utc>) -> bool {
        self.lookup(identifier, now).is_some()
    }

    /// First live entry matching any of `subjects`.
    pub fn lookup_any<'a, I>(&self, subjects: I, now: DateTime<Utc>) -> Option<ListEntry>
    where
        I: IntoIterator<Item = &'a str>,
    {
        subjects
            .into_iter()
            .find_map(|subject| self.lookup(subject, now))
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Live entries, sorted by identifier.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<ListEntry> {
        let mut entries: Vec<ListEntry> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
