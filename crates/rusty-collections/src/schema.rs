// File: rusty-collections/src/schema.rs
// Purpose: Static entity schemas and the catalog of known entity types

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::value::{Record, Value};

/// Declared type of an entity field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    /// Time-ordered 128-bit identifier, stored as 16 bytes.
    Id,
    List(Box<FieldKind>),
    Message(Vec<FieldDef>),
}

impl FieldKind {
    /// Value a field of this kind holds when it is absent or cleared.
    pub fn zero(&self) -> Value {
        match self {
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Int => Value::Int(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::String => Value::String(String::new()),
            FieldKind::Bytes => Value::Bytes(Vec::new()),
            FieldKind::Id => Value::Bytes(vec![0; 16]),
            FieldKind::List(_) => Value::List(Vec::new()),
            FieldKind::Message(_) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Suffix marking a field as a binary identifier (`widgetId`, `ownerId`).
pub const ID_SUFFIX: &str = "Id";

/// Whether `name` follows the identifier naming convention.
pub fn is_identifier_field(name: &str) -> bool {
    name == "id" || name.ends_with(ID_SUFFIX)
}

/// Find a field definition by name.
pub fn find_field<'a>(fields: &'a [FieldDef], name: &str) -> Option<&'a FieldDef> {
    fields.iter().find(|f| f.name == name)
}

/// Give every declared field absent from `record` its zero value.
///
/// Nested records of message fields are filled the same way.
pub fn fill_zero_fields(fields: &[FieldDef], record: &mut Record) {
    for def in fields {
        match (record.get_mut(&def.name), &def.kind) {
            (Some(Value::Record(nested)), FieldKind::Message(defs)) => fill_zero_fields(defs, nested),
            (Some(_), _) => {}
            (None, kind) => {
                record.insert(def.name.clone(), kind.zero());
            }
        }
    }
}

/// Fully qualified RPC method, written `service/method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MethodDescriptor {
    service: String,
    method: String,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

impl FromStr for MethodDescriptor {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {
                Ok(Self::new(service, method))
            }
            _ => Err(SchemaError::InvalidMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for MethodDescriptor {
    type Error = SchemaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MethodDescriptor> for String {
    fn from(m: MethodDescriptor) -> Self {
        m.to_string()
    }
}

/// Static descriptor of one server-defined entity type.
///
/// Built once (in code or from a manifest) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEntitySchema")]
pub struct EntitySchema {
    name: String,
    fields: Vec<FieldDef>,
    #[serde(rename = "key")]
    key_fields: Vec<String>,
    /// Unary snapshot fetch.
    list: MethodDescriptor,
    /// Server-streaming incremental sync.
    sync: MethodDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    insert: Option<MethodDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    update: Option<MethodDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delete: Option<MethodDescriptor>,
}

/// Manifest form of [`EntitySchema`]; normalized and checked on conversion.
#[derive(Deserialize)]
struct RawEntitySchema {
    name: String,
    fields: Vec<FieldDef>,
    key: Vec<String>,
    list: MethodDescriptor,
    sync: MethodDescriptor,
    #[serde(default)]
    insert: Option<MethodDescriptor>,
    #[serde(default)]
    update: Option<MethodDescriptor>,
    #[serde(default)]
    delete: Option<MethodDescriptor>,
}

impl TryFrom<RawEntitySchema> for EntitySchema {
    type Error = SchemaError;

    fn try_from(raw: RawEntitySchema) -> Result<Self, Self::Error> {
        let mut schema = EntitySchema {
            name: raw.name,
            fields: raw.fields,
            key_fields: raw.key,
            list: raw.list,
            sync: raw.sync,
            insert: raw.insert,
            update: raw.update,
            delete: raw.delete,
        };
        schema.promote_identifier_keys();
        schema.check()?;
        Ok(schema)
    }
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            key_fields: Vec::new(),
            list: None,
            sync: None,
            insert: None,
            update: None,
            delete: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        find_field(&self.fields, name)
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    pub fn list_method(&self) -> &MethodDescriptor {
        &self.list
    }

    pub fn sync_method(&self) -> &MethodDescriptor {
        &self.sync
    }

    pub fn insert_method(&self) -> Option<&MethodDescriptor> {
        self.insert.as_ref()
    }

    pub fn update_method(&self) -> Option<&MethodDescriptor> {
        self.update.as_ref()
    }

    pub fn delete_method(&self) -> Option<&MethodDescriptor> {
        self.delete.as_ref()
    }

    /// Binary key fields named like identifiers are identifiers.
    fn promote_identifier_keys(&mut self) {
        for def in &mut self.fields {
            if def.kind == FieldKind::Bytes
                && is_identifier_field(&def.name)
                && self.key_fields.contains(&def.name)
            {
                def.kind = FieldKind::Id;
            }
        }
    }

    /// Check the structural rules every schema must satisfy.
    pub fn check(&self) -> Result<(), SchemaError> {
        if self.name.is_empty() {
            return Err(SchemaError::EmptyName);
        }
        if self.key_fields.is_empty() {
            return Err(SchemaError::EmptyKey {
                entity: self.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    entity: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }

        for key in &self.key_fields {
            match self.field(key) {
                None => {
                    return Err(SchemaError::UnknownKeyField {
                        entity: self.name.clone(),
                        field: key.clone(),
                    })
                }
                Some(def) if matches!(def.kind, FieldKind::List(_) | FieldKind::Message(_)) => {
                    return Err(SchemaError::UnkeyableField {
                        entity: self.name.clone(),
                        field: key.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

pub struct EntitySchemaBuilder {
    name: String,
    fields: Vec<FieldDef>,
    key_fields: Vec<String>,
    list: Option<MethodDescriptor>,
    sync: Option<MethodDescriptor>,
    insert: Option<MethodDescriptor>,
    update: Option<MethodDescriptor>,
    delete: Option<MethodDescriptor>,
}

impl EntitySchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef::new(name, kind));
        self
    }

    /// Declare a field and append it to the primary key.
    pub fn key(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        self.key_fields.push(name.clone());
        self.fields.push(FieldDef::new(name, kind));
        self
    }

    pub fn list(mut self, method: MethodDescriptor) -> Self {
        self.list = Some(method);
        self
    }

    pub fn sync(mut self, method: MethodDescriptor) -> Self {
        self.sync = Some(method);
        self
    }

    pub fn insert(mut self, method: MethodDescriptor) -> Self {
        self.insert = Some(method);
        self
    }

    pub fn update(mut self, method: MethodDescriptor) -> Self {
        self.update = Some(method);
        self
    }

    pub fn delete(mut self, method: MethodDescriptor) -> Self {
        self.delete = Some(method);
        self
    }

    pub fn build(self) -> Result<EntitySchema, SchemaError> {
        let list = self.list.ok_or_else(|| SchemaError::MissingMethod {
            entity: self.name.clone(),
            method: "list",
        })?;
        let sync = self.sync.ok_or_else(|| SchemaError::MissingMethod {
            entity: self.name.clone(),
            method: "sync",
        })?;

        let mut schema = EntitySchema {
            name: self.name,
            fields: self.fields,
            key_fields: self.key_fields,
            list,
            sync,
            insert: self.insert,
            update: self.update,
            delete: self.delete,
        };
        schema.promote_identifier_keys();
        schema.check()?;
        Ok(schema)
    }
}

/// The static list of entity schemas known to the process.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    entities: Vec<Arc<EntitySchema>>,
}

impl SchemaCatalog {
    pub fn new(entities: Vec<EntitySchema>) -> Result<Self, SchemaError> {
        let mut names = HashSet::new();
        for schema in &entities {
            schema.check()?;
            if !names.insert(schema.name().to_string()) {
                return Err(SchemaError::DuplicateEntity(schema.name().to_string()));
            }
        }

        Ok(Self {
            entities: entities.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntitySchema>> {
        self.entities.iter().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
