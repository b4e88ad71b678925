// File: rusty-collections/src/lib.rs
// Purpose: Main entry point for rusty-collections library

//! # rusty-collections
//!
//! Client-side sync engine: in-memory collections of server entities, kept
//! current by a snapshot fetch plus an incremental sync stream, with
//! optimistic mutations that settle once the server confirms them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rusty_collections::{CollectionRegistry, Delta, Manifest};
//!
//! // 1. Load the entity catalog and settings
//! let (config, catalog) = Manifest::from_file("sync.toml")?.into_parts()?;
//!
//! // 2. Start one collection per entity and wait for the snapshots
//! let registry = CollectionRegistry::start(&catalog, transport, config);
//! registry.ready().await?;
//!
//! // 3. Read locally, write optimistically
//! let widgets = registry.collection("widget")?;
//! widgets.update(vec![Delta::new().set("widgetId", id).set("name", "B")]).await?;
//!
//! registry.shutdown().await?;
//! ```

pub mod change;
pub mod collection;
pub mod config;
pub mod delta;
pub mod driver;
pub mod error;
pub mod event;
pub mod key;
mod pacer;
pub mod registry;
pub mod schema;
pub mod transport;
pub mod value;
pub mod wire;

pub use change::{Change, ChangeAction, ChangeOrigin, ChangeSet};
pub use collection::Collection;
pub use config::{Manifest, SyncConfig, SyncTomlConfig};
pub use delta::{merge_delta, Delta, Patch};
pub use driver::{SyncDriver, SyncPhase};
pub use error::{
    CollectionError, KeyError, RegistryError, SchemaError, SyncError, TransportError,
    TransportErrorKind, ValidationError,
};
pub use event::SyncEvent;
pub use key::{new_id, KeyCodec, KeyFields, KeySource};
pub use registry::CollectionRegistry;
pub use schema::{EntitySchema, FieldDef, FieldKind, MethodDescriptor, SchemaCatalog};
pub use transport::{MemoryTransport, MessageStream, Transport};
pub use value::{Record, Value};
pub use wire::{Json, Validator};
