// File: rusty-collections/src/wire.rs
// Purpose: JSON wire codec and schema validation of incoming payloads

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Number};
use uuid::Uuid;

use crate::delta::{Delta, Patch};
use crate::error::ValidationError;
use crate::schema::{find_field, EntitySchema, FieldDef, FieldKind};
use crate::value::{Record, Value};

pub type Json = serde_json::Value;

struct Fault {
    path: String,
    reason: String,
}

impl Fault {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: if path.is_empty() { "$".into() } else { path.into() },
            reason: reason.into(),
        }
    }
}

fn child(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Encode a value in wire form; `kind` selects identifier or nested encodings.
pub fn encode_value(kind: Option<&FieldKind>, value: &Value) -> Json {
    match (kind, value) {
        (_, Value::Null) => Json::Null,
        (Some(FieldKind::Id), Value::Bytes(bytes)) => match Uuid::from_slice(bytes) {
            Ok(id) => Json::String(id.hyphenated().to_string()),
            Err(_) => Json::String(STANDARD.encode(bytes)),
        },
        (Some(FieldKind::List(inner)), Value::List(items)) => Json::Array(
            items
                .iter()
                .map(|item| encode_value(Some(inner), item))
                .collect(),
        ),
        (Some(FieldKind::Message(defs)), Value::Record(record)) => encode_fields(defs, record),
        (_, Value::Bool(b)) => Json::Bool(*b),
        (_, Value::Int(n)) => Json::Number((*n).into()),
        (_, Value::Float(f)) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        (_, Value::String(s)) => Json::String(s.clone()),
        (_, Value::Bytes(bytes)) => Json::String(STANDARD.encode(bytes)),
        (_, Value::List(items)) => {
            Json::Array(items.iter().map(|item| encode_value(None, item)).collect())
        }
        (_, Value::Record(record)) => encode_fields(&[], record),
    }
}

fn encode_fields(defs: &[FieldDef], record: &Record) -> Json {
    let map = record
        .iter()
        .map(|(name, value)| {
            let kind = find_field(defs, name).map(|def| &def.kind);
            (name.clone(), encode_value(kind, value))
        })
        .collect::<Map<String, Json>>();
    Json::Object(map)
}

/// Encode a full entity (or key object) of `schema`.
pub fn encode_record(schema: &EntitySchema, record: &Record) -> Json {
    encode_fields(schema.fields(), record)
}

/// Encode a delta, writing cleared fields as `sentinel`.
pub fn encode_delta(schema: &EntitySchema, delta: &Delta, sentinel: &Json) -> Json {
    encode_delta_fields(schema.fields(), delta, sentinel)
}

fn encode_delta_fields(defs: &[FieldDef], delta: &Delta, sentinel: &Json) -> Json {
    let map = delta
        .iter()
        .map(|(name, patch)| {
            let kind = find_field(defs, name).map(|def| &def.kind);
            let json = match patch {
                Patch::Set(value) => encode_value(kind, value),
                Patch::Unset => sentinel.clone(),
                Patch::Merge(nested) => {
                    let nested_defs = match kind {
                        Some(FieldKind::Message(defs)) => defs.as_slice(),
                        _ => &[],
                    };
                    encode_delta_fields(nested_defs, nested, sentinel)
                }
            };
            (name.clone(), json)
        })
        .collect::<Map<String, Json>>();
    Json::Object(map)
}

/// Decode one wire value of the declared `kind`.
///
/// `null` decodes to the kind's zero value.
pub fn decode_value(kind: &FieldKind, json: &Json) -> Result<Value, String> {
    decode_at(kind, json, "").map_err(|fault| fault.reason)
}

fn decode_at(kind: &FieldKind, json: &Json, path: &str) -> Result<Value, Fault> {
    let mismatch = || {
        Fault::new(
            path,
            format!("expected {}, found {}", kind_label(kind), json_kind(json)),
        )
    };

    match (kind, json) {
        (_, Json::Null) => Ok(kind.zero()),
        (FieldKind::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldKind::Int, Json::Number(n)) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| Fault::new(path, format!("{n} is not a 64-bit integer"))),
        (FieldKind::Int, Json::String(s)) => s
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| Fault::new(path, format!("invalid integer {s:?}: {e}"))),
        (FieldKind::Float, Json::Number(n)) => n.as_f64().map(Value::Float).ok_or_else(mismatch),
        (FieldKind::Float, Json::String(s)) => s
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| Fault::new(path, format!("invalid float {s:?}: {e}"))),
        (FieldKind::String, Json::String(s)) => Ok(Value::String(s.clone())),
        (FieldKind::Bytes, Json::String(s)) => STANDARD
            .decode(s)
            .map(Value::Bytes)
            .map_err(|e| Fault::new(path, format!("invalid base64: {e}"))),
        (FieldKind::Id, Json::String(s)) => Uuid::parse_str(s)
            .map(Value::from)
            .map_err(|e| Fault::new(path, format!("invalid identifier {s:?}: {e}"))),
        (FieldKind::List(inner), Json::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| decode_at(inner, item, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (FieldKind::Message(defs), Json::Object(map)) => {
            decode_fields(defs, map, path, true).map(Value::Record)
        }
        _ => Err(mismatch()),
    }
}

fn kind_label(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Bool => "bool",
        FieldKind::Int => "integer",
        FieldKind::Float => "float",
        FieldKind::String => "string",
        FieldKind::Bytes => "base64 string",
        FieldKind::Id => "identifier string",
        FieldKind::List(_) => "array",
        FieldKind::Message(_) => "object",
    }
}

/// Decode declared fields; `fill` gives absent fields their zero value.
fn decode_fields(
    defs: &[FieldDef],
    map: &Map<String, Json>,
    path: &str,
    fill: bool,
) -> Result<Record, Fault> {
    let mut record = Record::new();
    for def in defs {
        match map.get(&def.name) {
            Some(json) => {
                let value = decode_at(&def.kind, json, &child(path, &def.name))?;
                record.insert(def.name.clone(), value);
            }
            None if fill => {
                record.insert(def.name.clone(), def.kind.zero());
            }
            None => {}
        }
    }

    for name in map.keys().filter(|name| find_field(defs, name).is_none()) {
        tracing::trace!(field = %child(path, name), "ignoring undeclared field");
    }

    Ok(record)
}

fn decode_delta_fields(
    defs: &[FieldDef],
    map: &Map<String, Json>,
    path: &str,
    sentinel: &Json,
) -> Result<Delta, Fault> {
    let mut delta = Delta::new();
    for (name, json) in map {
        let Some(def) = find_field(defs, name) else {
            tracing::trace!(field = %child(path, name), "ignoring undeclared field");
            continue;
        };
        let field_path = child(path, name);
        let patch = match (&def.kind, json) {
            _ if json == sentinel => Patch::Unset,
            (FieldKind::Message(nested), Json::Object(inner)) => {
                Patch::Merge(decode_delta_fields(nested, inner, &field_path, sentinel)?)
            }
            (kind, json) => Patch::Set(decode_at(kind, json, &field_path)?),
        };
        delta.insert(name.clone(), patch);
    }
    Ok(delta)
}

/// Validates raw payloads against one entity schema.
pub struct Validator<'a> {
    schema: &'a EntitySchema,
    sentinel: &'a Json,
}

impl<'a> Validator<'a> {
    pub fn new(schema: &'a EntitySchema, sentinel: &'a Json) -> Self {
        Self { schema, sentinel }
    }

    pub fn schema(&self) -> &'a EntitySchema {
        self.schema
    }

    /// A full entity; every declared field ends up populated.
    pub fn entity(&self, raw: &Json) -> Result<Record, ValidationError> {
        let map = self.object(raw)?;
        self.require_keys(map)?;
        decode_fields(self.schema.fields(), map, "", true).map_err(|f| self.error(f))
    }

    /// A delta; key fields must be present as plain values.
    pub fn delta(&self, raw: &Json) -> Result<Delta, ValidationError> {
        let map = self.object(raw)?;
        self.require_keys(map)?;
        decode_delta_fields(self.schema.fields(), map, "", self.sentinel)
            .map_err(|f| self.error(f))
    }

    /// Just the key fields of an item (extra fields are dropped).
    pub fn key(&self, raw: &Json) -> Result<Record, ValidationError> {
        let map = self.object(raw)?;
        self.require_keys(map)?;
        let decoded =
            decode_fields(self.schema.fields(), map, "", false).map_err(|f| self.error(f))?;
        Ok(decoded
            .into_iter()
            .filter(|(name, _)| self.schema.key_fields().contains(name))
            .collect())
    }

    fn object<'j>(&self, raw: &'j Json) -> Result<&'j Map<String, Json>, ValidationError> {
        raw.as_object().ok_or_else(|| {
            self.error(Fault::new(
                "",
                format!("expected object, found {}", json_kind(raw)),
            ))
        })
    }

    fn require_keys(&self, map: &Map<String, Json>) -> Result<(), ValidationError> {
        for key in self.schema.key_fields() {
            match map.get(key) {
                None | Some(Json::Null) => {
                    return Err(self.error(Fault::new(key, "missing key field")))
                }
                Some(json) if json == self.sentinel => {
                    return Err(self.error(Fault::new(key, "key field cannot be unset")))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn error(&self, fault: Fault) -> ValidationError {
        ValidationError::new(self.schema.name(), fault.path, fault.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> EntitySchema {
        EntitySchema::builder("widget")
            .key("widgetId", FieldKind::Id)
            .field("name", FieldKind::String)
            .field("count", FieldKind::Int)
            .field("blob", FieldKind::Bytes)
            .field("tags", FieldKind::List(Box::new(FieldKind::String)))
            .field(
                "dims",
                FieldKind::Message(vec![
                    FieldDef::new("w", FieldKind::Int),
                    FieldDef::new("h", FieldKind::Int),
                ]),
            )
            .list("widgets.v1.WidgetService/ListWidgets".parse().unwrap())
            .sync("widgets.v1.WidgetService/SyncWidgets".parse().unwrap())
            .build()
            .unwrap()
    }

    fn sentinel() -> Json {
        json!({"$unset": true})
    }

    const ID: &str = "01890a5d-ac96-774b-bcce-b302099a8057";

    #[test]
    fn test_entity_fills_missing_fields_with_zero() {
        let schema = schema();
        let sentinel = sentinel();
        let validator = Validator::new(&schema, &sentinel);

        let record = validator
            .entity(&json!({"widgetId": ID, "name": "A", "unknown": 1}))
            .unwrap();

        assert_eq!(record.get("name"), Some(&Value::from("A")));
        assert_eq!(record.get("count"), Some(&Value::Int(0)));
        assert_eq!(record.get("tags"), Some(&Value::List(vec![])));
        assert_eq!(record.get("dims"), Some(&Value::Null));
        assert!(!record.contains("unknown"));
        assert_eq!(
            record.get("widgetId").and_then(Value::as_uuid),
            Some(Uuid::parse_str(ID).unwrap())
        );
    }

    #[test]
    fn test_entity_type_mismatch_reports_path() {
        let schema = schema();
        let sentinel = sentinel();
        let validator = Validator::new(&schema, &sentinel);

        let err = validator
            .entity(&json!({"widgetId": ID, "dims": {"w": "wide"}}))
            .unwrap_err();
        assert_eq!(err.path, "dims.w");

        let err = validator
            .entity(&json!({"widgetId": ID, "tags": ["a", 2]}))
            .unwrap_err();
        assert_eq!(err.path, "tags[1]");
    }

    #[test]
    fn test_entity_requires_key() {
        let schema = schema();
        let sentinel = sentinel();
        let validator = Validator::new(&schema, &sentinel);

        let err = validator.entity(&json!({"name": "A"})).unwrap_err();
        assert_eq!(err.path, "widgetId");
        assert!(validator.entity(&json!(["not", "an", "object"])).is_err());
        assert!(validator.entity(&json!({"widgetId": "nope"})).is_err());
    }

    #[test]
    fn test_int_accepts_decimal_strings() {
        assert_eq!(decode_value(&FieldKind::Int, &json!("-12")), Ok(Value::Int(-12)));
        assert!(decode_value(&FieldKind::Int, &json!(1.5)).is_err());
    }

    #[test]
    fn test_delta_decodes_sentinel_and_nested() {
        let schema = schema();
        let sentinel = sentinel();
        let validator = Validator::new(&schema, &sentinel);

        let delta = validator
            .delta(&json!({
                "widgetId": ID,
                "name": {"$unset": true},
                "dims": {"w": 4, "h": {"$unset": true}},
            }))
            .unwrap();

        assert_eq!(delta.get("name"), Some(&Patch::Unset));
        assert_eq!(
            delta.get("dims"),
            Some(&Patch::Merge(Delta::new().set("w", 4i64).unset("h")))
        );
        assert!(delta.get("count").is_none());
    }

    #[test]
    fn test_delta_rejects_unset_key() {
        let schema = schema();
        let sentinel = sentinel();
        let validator = Validator::new(&schema, &sentinel);

        assert!(validator
            .delta(&json!({"widgetId": {"$unset": true}}))
            .is_err());
    }

    #[test]
    fn test_encode_delta_writes_sentinel() {
        let schema = schema();
        let id = Uuid::parse_str(ID).unwrap();
        let delta = Delta::new()
            .set("widgetId", id)
            .unset("name")
            .merge("dims", Delta::new().set("w", 1i64));

        assert_eq!(
            encode_delta(&schema, &delta, &sentinel()),
            json!({"widgetId": ID, "name": {"$unset": true}, "dims": {"w": 1}})
        );
    }

    #[test]
    fn test_encode_record_round_trips_through_validator() {
        let schema = schema();
        let sentinel = sentinel();
        let validator = Validator::new(&schema, &sentinel);

        let raw = json!({
            "widgetId": ID,
            "name": "A",
            "count": 3,
            "blob": "AQID",
            "tags": ["x"],
            "dims": {"w": 1, "h": 2},
        });
        let record = validator.entity(&raw).unwrap();
        assert_eq!(record.get("blob"), Some(&Value::Bytes(vec![1, 2, 3])));
        assert_eq!(encode_record(&schema, &record), raw);
    }

    #[test]
    fn test_key_projects_key_fields() {
        let schema = schema();
        let sentinel = sentinel();
        let validator = Validator::new(&schema, &sentinel);

        let key = validator.key(&json!({"widgetId": ID, "name": "A"})).unwrap();
        assert_eq!(key.len(), 1);
        assert!(key.contains("widgetId"));
    }
}
