// File: rusty-collections/src/event.rs
// Purpose: Incremental sync events and decoding of stream messages

use serde::Deserialize;

use crate::delta::Delta;
use crate::error::ValidationError;
use crate::key::KeyFields;
use crate::value::Record;
use crate::wire::{Json, Validator};

/// One change delivered by the sync stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Brand-new entity; replaces any entity with the same key.
    Insert(Record),
    /// Partial update merged onto the stored entity.
    Update(Delta),
    /// Update when the key is present, insert otherwise.
    Upsert(Record),
    Delete(KeyFields),
}

/// Wire shape of one stream message: an event kind plus its items.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "lowercase")]
enum WireBatch {
    Insert(Vec<Json>),
    Update(Vec<Json>),
    Upsert(Vec<Json>),
    Delete(Vec<Json>),
}

/// Decode one stream message into an ordered batch.
///
/// Items failing validation are logged and skipped; a message that is not a
/// batch at all is an error for the caller to log.
pub fn decode_batch(validator: &Validator<'_>, raw: Json) -> Result<Vec<SyncEvent>, ValidationError> {
    let entity = validator.schema().name();
    let batch: WireBatch = serde_json::from_value(raw)
        .map_err(|e| ValidationError::new(entity, "$", e.to_string()))?;

    let (kind, items): (&str, Vec<Result<SyncEvent, ValidationError>>) = match batch {
        WireBatch::Insert(items) => (
            "insert",
            items.iter().map(|raw| validator.entity(raw).map(SyncEvent::Insert)).collect(),
        ),
        WireBatch::Update(items) => (
            "update",
            items.iter().map(|raw| validator.delta(raw).map(SyncEvent::Update)).collect(),
        ),
        WireBatch::Upsert(items) => (
            "upsert",
            items.iter().map(|raw| validator.entity(raw).map(SyncEvent::Upsert)).collect(),
        ),
        WireBatch::Delete(items) => (
            "delete",
            items.iter().map(|raw| validator.key(raw).map(SyncEvent::Delete)).collect(),
        ),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(entity, kind, error = %e, "skipping malformed sync item");
                None
            }
        })
        .collect())
}
