// File: rusty-collections/src/change.rs
// Purpose: Change notifications published by collections

use chrono::{DateTime, Utc};

use crate::value::Record;

/// What happened to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Insert => write!(f, "insert"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
        }
    }
}

/// Where a change set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A committed sync batch (server-confirmed).
    Sync,
    /// An optimistic local mutation.
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub key: String,
    pub action: ChangeAction,
    /// Stored value after the change; `None` for deletes.
    pub value: Option<Record>,
}

/// Everything one commit (or one optimistic write) changed, published atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub entity: String,
    pub origin: ChangeOrigin,
    pub at: DateTime<Utc>,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
