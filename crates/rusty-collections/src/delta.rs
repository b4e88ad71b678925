// File: rusty-collections/src/delta.rs
// Purpose: Partial updates and the in-place delta merge

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::value::{Record, Value};

/// What a delta does to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Overwrite with this value (nested records merge field by field).
    Set(Value),
    /// Field intentionally cleared to its zero value.
    Unset,
    /// Nested partial update of a message field.
    Merge(Delta),
}

/// A partial entity: key fields plus the fields being changed.
///
/// Fields absent from the delta are left untouched by [`merge_delta`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Delta {
    fields: BTreeMap<String, Patch>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), Patch::Set(value.into()));
        self
    }

    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Patch::Unset);
        self
    }

    pub fn merge(mut self, name: impl Into<String>, nested: Delta) -> Self {
        self.fields.insert(name.into(), Patch::Merge(nested));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, patch: Patch) -> Option<Patch> {
        self.fields.insert(name.into(), patch)
    }

    pub fn get(&self, name: &str) -> Option<&Patch> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Patch)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// A delta that sets every field of `record`.
    pub fn from_record(record: &Record) -> Self {
        Self {
            fields: record
                .iter()
                .map(|(name, value)| (name.clone(), Patch::Set(value.clone())))
                .collect(),
        }
    }

    /// Fold a later delta for the same entity into this one.
    ///
    /// Later patches win field by field; nested merges combine. A field
    /// cleared or overwritten here and then patched field by field cannot be
    /// written as one delta, so `later` is handed back untouched when any
    /// field needs that.
    pub fn absorb(&mut self, later: Delta) -> Result<(), Delta> {
        if !self.can_absorb(&later) {
            return Err(later);
        }
        self.fold(later);
        Ok(())
    }

    /// Whether applying `self` then `later` equals applying one folded delta.
    pub fn can_absorb(&self, later: &Delta) -> bool {
        later.iter().all(|(name, patch)| {
            let Some(earlier) = self.get(name) else {
                return true;
            };
            match (nested_view(earlier), nested_view(patch)) {
                (Some(earlier), Some(patch)) => earlier.can_absorb(&patch),
                // A non-record value followed by a nested patch starts a fresh record.
                (None, Some(_)) => false,
                _ => true,
            }
        })
    }

    fn fold(&mut self, later: Delta) {
        for (name, patch) in later.fields {
            let earlier = self.fields.remove(&name);
            let combined = match into_nested(patch) {
                Ok(nested) => {
                    let mut folded = earlier
                        .and_then(|patch| into_nested(patch).ok())
                        .unwrap_or_default();
                    folded.fold(nested);
                    Patch::Merge(folded)
                }
                Err(patch) => patch,
            };
            self.fields.insert(name, combined);
        }
    }
}

/// `Set` of a record merges exactly like `Merge` of that record's fields.
fn into_nested(patch: Patch) -> Result<Delta, Patch> {
    match patch {
        Patch::Merge(nested) => Ok(nested),
        Patch::Set(Value::Record(record)) => Ok(Delta::from_record(&record)),
        other => Err(other),
    }
}

/// A patch that merges into a nested record, seen as a delta.
fn nested_view(patch: &Patch) -> Option<Cow<'_, Delta>> {
    match patch {
        Patch::Merge(nested) => Some(Cow::Borrowed(nested)),
        Patch::Set(Value::Record(record)) => Some(Cow::Owned(Delta::from_record(record))),
        _ => None,
    }
}

/// Apply `delta` onto `target` in place.
///
/// Idempotent: applying the same delta twice equals applying it once.
pub fn merge_delta(target: &mut Record, delta: &Delta) {
    for (name, patch) in delta.iter() {
        match patch {
            Patch::Unset => {
                if let Some(current) = target.get_mut(name) {
                    *current = current.zero();
                }
            }
            Patch::Set(Value::Record(nested)) => match target.get_mut(name) {
                Some(Value::Record(current)) => merge_record(current, nested),
                _ => {
                    target.insert(name.clone(), Value::Record(nested.clone()));
                }
            },
            Patch::Set(value) => {
                target.insert(name.clone(), value.clone());
            }
            Patch::Merge(nested) => match target.get_mut(name) {
                Some(Value::Record(current)) => merge_delta(current, nested),
                _ => {
                    let mut fresh = Record::new();
                    merge_delta(&mut fresh, nested);
                    target.insert(name.clone(), Value::Record(fresh));
                }
            },
        }
    }
}

fn merge_record(target: &mut Record, source: &Record) {
    for (name, value) in source.iter() {
        match (target.get_mut(name), value) {
            (Some(Value::Record(current)), Value::Record(nested)) => merge_record(current, nested),
            _ => {
                target.insert(name.clone(), value.clone());
            }
        }
    }
}
