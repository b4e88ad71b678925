// File: rusty-collections/src/key.rs
// Purpose: Stable string keys derived from an entity's key fields

use serde_json::Map;
use uuid::Uuid;

use crate::delta::{Delta, Patch};
use crate::error::KeyError;
use crate::schema::{EntitySchema, FieldKind};
use crate::value::{Record, Value};
use crate::wire::{self, Json};

pub use crate::schema::{is_identifier_field, ID_SUFFIX};

/// The key fields of one entity, projected out of a full or partial item.
pub type KeyFields = Record;

/// Generate a new time-ordered identifier value.
///
/// The canonical text of identifiers generated later sorts after earlier ones.
pub fn new_id() -> Value {
    Value::from(Uuid::now_v7())
}

/// Anything key fields can be read from.
pub trait KeySource {
    fn key_field(&self, name: &str) -> Option<&Value>;
}

impl KeySource for Record {
    fn key_field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl KeySource for Delta {
    fn key_field(&self, name: &str) -> Option<&Value> {
        match self.get(name) {
            Some(Patch::Set(value)) => Some(value),
            _ => None,
        }
    }
}

/// Derives and parses keys for one entity type.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    entity: String,
    fields: Vec<(String, FieldKind)>,
}

impl KeyCodec {
    pub fn new(schema: &EntitySchema) -> Self {
        let fields = schema
            .key_fields()
            .iter()
            .map(|name| {
                let kind = schema
                    .field(name)
                    .map(|def| def.kind.clone())
                    .unwrap_or(FieldKind::String);
                (name.clone(), kind)
            })
            .collect();

        Self {
            entity: schema.name().to_string(),
            fields,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Project the declared key fields present on `source`.
    pub fn key_object<S: KeySource + ?Sized>(&self, source: &S) -> KeyFields {
        self.fields
            .iter()
            .filter_map(|(name, _)| {
                source
                    .key_field(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    /// Canonical key string for `source`.
    pub fn get_key<S: KeySource + ?Sized>(&self, source: &S) -> String {
        let map = self
            .fields
            .iter()
            .filter_map(|(name, kind)| {
                source
                    .key_field(name)
                    .map(|value| (name.clone(), wire::encode_value(Some(kind), value)))
            })
            .collect::<Map<String, Json>>();
        Json::Object(map).to_string()
    }

    /// Like [`get_key`](Self::get_key), but every key field must hold a
    /// non-null value that [`parse_key`](Self::parse_key) can read back.
    pub fn require_key<S: KeySource + ?Sized>(&self, source: &S) -> Result<String, KeyError> {
        for (name, kind) in &self.fields {
            match source.key_field(name) {
                None | Some(Value::Null) => {
                    return Err(KeyError::MissingField {
                        entity: self.entity.clone(),
                        field: name.clone(),
                    })
                }
                Some(value) if *kind == FieldKind::Id && value.as_uuid().is_none() => {
                    return Err(KeyError::InvalidField {
                        entity: self.entity.clone(),
                        field: name.clone(),
                        reason: format!("expected a 16-byte identifier, found {}", value.kind_name()),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(self.get_key(source))
    }

    /// Inverse of [`get_key`](Self::get_key).
    pub fn parse_key(&self, key: &str) -> Result<KeyFields, KeyError> {
        let malformed = |reason: String| KeyError::Malformed {
            key: key.to_string(),
            reason,
        };

        let raw: Json = serde_json::from_str(key).map_err(|e| malformed(e.to_string()))?;
        let Json::Object(map) = raw else {
            return Err(malformed("expected a JSON object".into()));
        };

        let mut fields = KeyFields::new();
        for (name, json) in map {
            let (_, kind) = self
                .fields
                .iter()
                .find(|(field, _)| *field == name)
                .ok_or_else(|| malformed(format!("`{name}` is not a key field")))?;

            let value = if json.is_null() {
                Value::Null
            } else {
                wire::decode_value(kind, &json).map_err(|reason| malformed(format!("{name}: {reason}")))?
            };
            fields.insert(name, value);
        }

        Ok(fields)
    }
}
