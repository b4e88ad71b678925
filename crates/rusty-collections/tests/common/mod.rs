#![allow(dead_code)]

use std::sync::Arc;

use rusty_collections::{
    ChangeOrigin, ChangeSet, Collection, EntitySchema, FieldDef, FieldKind, MemoryTransport,
    MethodDescriptor, Record, SyncConfig, SyncDriver, SyncError, Value,
};
use serde_json::{json, Value as Json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SERVICE: &str = "widgets.v1.WidgetService";

pub fn method(name: &str) -> MethodDescriptor {
    MethodDescriptor::new(SERVICE, name)
}

pub fn list() -> MethodDescriptor {
    method("ListWidgets")
}

pub fn sync() -> MethodDescriptor {
    method("SyncWidgets")
}

pub fn insert() -> MethodDescriptor {
    method("InsertWidgets")
}

pub fn update() -> MethodDescriptor {
    method("UpdateWidgets")
}

pub fn delete() -> MethodDescriptor {
    method("DeleteWidgets")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `widget` keyed by `widgetId`, with every mutation method.
pub fn widget_schema() -> EntitySchema {
    EntitySchema::builder("widget")
        .key("widgetId", FieldKind::Id)
        .field("name", FieldKind::String)
        .field(
            "dims",
            FieldKind::Message(vec![
                FieldDef::new("w", FieldKind::Int),
                FieldDef::new("h", FieldKind::Int),
            ]),
        )
        .list(list())
        .sync(sync())
        .insert(insert())
        .update(update())
        .delete(delete())
        .build()
        .unwrap()
}

/// Same as [`widget_schema`] without insert or delete methods.
pub fn read_mostly_schema() -> EntitySchema {
    EntitySchema::builder("widget")
        .key("widgetId", FieldKind::Id)
        .field("name", FieldKind::String)
        .list(list())
        .sync(sync())
        .update(update())
        .build()
        .unwrap()
}

pub struct Harness {
    pub transport: MemoryTransport,
    pub collection: Collection,
    pub changes: broadcast::Receiver<Arc<ChangeSet>>,
    pub cancel: CancellationToken,
    pub driver: JoinHandle<Result<(), SyncError>>,
}

impl Harness {
    /// Start a driver for `schema`; the snapshot reply must already be scripted.
    pub fn start(transport: &MemoryTransport, schema: EntitySchema, config: SyncConfig) -> Self {
        init_tracing();
        let collection = Collection::new(
            Arc::new(schema),
            Arc::new(transport.clone()),
            Arc::new(config),
        );
        let changes = collection.subscribe();
        let cancel = CancellationToken::new();
        let driver = SyncDriver::new(collection.clone(), cancel.clone()).spawn();

        Self {
            transport: transport.clone(),
            collection,
            changes,
            cancel,
            driver,
        }
    }

    /// Start with the given snapshot items and wait for readiness.
    pub async fn ready_with(items: Vec<Json>, config: SyncConfig) -> Self {
        let transport = MemoryTransport::new();
        transport.reply(&list(), json!({ "items": items }));
        let harness = Self::start(&transport, widget_schema(), config);
        harness.collection.ready().await.unwrap();
        harness.transport.wait_for_stream(&sync()).await;
        harness
    }

    pub fn key(&self, record: &Record) -> String {
        self.collection.key_codec().get_key(record)
    }

    /// Next change set of the given origin, skipping others.
    pub async fn next_change(&mut self, origin: ChangeOrigin) -> Arc<ChangeSet> {
        loop {
            let set = self.changes.recv().await.unwrap();
            if set.origin == origin {
                return set;
            }
        }
    }

    pub fn push(&self, message: Json) {
        assert_eq!(self.transport.push(&sync(), message), 1);
    }
}

pub fn widget(id: &Value, name: &str) -> Record {
    Record::new().with("widgetId", id.clone()).with("name", name)
}

/// Wire form of an identifier value.
pub fn id_text(id: &Value) -> String {
    id.as_uuid().unwrap().to_string()
}
