// File: rusty-collections/src/driver.rs
// Purpose: Sync stream driver: snapshot, buffered replay, live apply

use std::fmt;

use futures::StreamExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collection::{Collection, WriteOp};
use crate::delta::Delta;
use crate::error::{SyncError, TransportError};
use crate::event::{decode_batch, SyncEvent};
use crate::wire::{Json, Validator};

/// Lifecycle of a collection's sync driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// Not started.
    Idle,
    /// Snapshot in flight; stream messages are buffered.
    Priming,
    /// Replaying messages buffered while priming.
    Draining,
    /// Applying messages as they arrive.
    Live,
    /// Cancelled cleanly.
    Stopped,
    /// Terminated by a fatal error.
    Failed,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Stopped | SyncPhase::Failed)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Priming => "priming",
            SyncPhase::Draining => "draining",
            SyncPhase::Live => "live",
            SyncPhase::Stopped => "stopped",
            SyncPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

enum Received {
    Message(Json),
    Finished(Result<(), SyncError>),
}

impl From<Option<Result<Json, TransportError>>> for Received {
    fn from(item: Option<Result<Json, TransportError>>) -> Self {
        match item {
            Some(Ok(message)) => Received::Message(message),
            // Teardown, not a failure.
            Some(Err(e)) if e.is_canceled() => Received::Finished(Ok(())),
            Some(Err(e)) => Received::Finished(Err(SyncError::Stream(e))),
            None => Received::Finished(Err(SyncError::StreamEnded)),
        }
    }
}

/// Keeps one collection in step with the server's sync stream.
pub struct SyncDriver {
    collection: Collection,
    cancel: CancellationToken,
}

impl SyncDriver {
    pub fn new(collection: Collection, cancel: CancellationToken) -> Self {
        Self { collection, cancel }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn spawn(self) -> JoinHandle<Result<(), SyncError>> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled (`Ok`) or a fatal stream error.
    ///
    /// There is no reconnect; a failed collection stays unsynced.
    pub async fn run(self) -> Result<(), SyncError> {
        let result = self.sync().await;
        let entity = self.collection.name();

        match &result {
            Ok(()) => {
                // Only matters if the first snapshot never landed.
                self.collection.mark_failed(SyncError::Cancelled);
                self.enter(SyncPhase::Stopped);
            }
            Err(e) => {
                self.collection.mark_failed(e.clone());
                self.enter(SyncPhase::Failed);
                tracing::error!(entity, error = %e, "sync driver terminated");
            }
        }
        result
    }

    async fn sync(&self) -> Result<(), SyncError> {
        let schema = self.collection.schema().clone();
        let transport = self.collection.transport().clone();
        let validator = Validator::new(&schema, &self.collection.config().unset_sentinel);

        self.enter(SyncPhase::Priming);
        let mut stream = transport.stream(schema.sync_method(), json!({}), self.cancel.child_token());
        let mut snapshot = transport.unary(schema.list_method(), json!({}));
        let mut buffered = Vec::new();

        let reply = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(()),
                reply = &mut snapshot => match reply {
                    Ok(reply) => break reply,
                    Err(e) if e.is_canceled() => return Ok(()),
                    Err(e) => return Err(SyncError::Snapshot(e)),
                },
                item = stream.next() => match Received::from(item) {
                    Received::Message(message) => buffered.push(message),
                    Received::Finished(result) => return result,
                },
            }
        };

        self.apply_snapshot(&validator, reply);
        self.collection.mark_ready();

        self.enter(SyncPhase::Draining);
        tracing::debug!(entity = %schema.name(), buffered = buffered.len(), "replaying buffered messages");
        for message in buffered {
            self.apply_message(&validator, message);
        }

        self.enter(SyncPhase::Live);
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(()),
                item = stream.next() => match Received::from(item) {
                    Received::Message(message) => self.apply_message(&validator, message),
                    Received::Finished(result) => return result,
                },
            }
        }
    }

    fn enter(&self, phase: SyncPhase) {
        tracing::info!(entity = %self.collection.name(), %phase, "sync phase");
        self.collection.set_phase(phase);
    }

    fn apply_snapshot(&self, validator: &Validator<'_>, reply: Json) {
        let entity = self.collection.name();
        let items = match reply {
            Json::Object(mut map) => match map.remove("items") {
                Some(Json::Array(items)) => items,
                None | Some(Json::Null) => Vec::new(),
                Some(_) => {
                    tracing::warn!(entity, "snapshot `items` is not a list");
                    Vec::new()
                }
            },
            _ => {
                tracing::warn!(entity, "snapshot reply is not an object");
                Vec::new()
            }
        };

        let mut tx = self.collection.begin();
        for raw in &items {
            match validator.entity(raw) {
                Ok(record) => tx.write(WriteOp::Insert(record)),
                Err(e) => tracing::warn!(entity, error = %e, "skipping malformed snapshot item"),
            }
        }
        let written = tx.len();
        tx.commit();
        tracing::info!(entity, items = written, "snapshot committed");
    }

    /// Apply one stream message as a single transaction.
    fn apply_message(&self, validator: &Validator<'_>, raw: Json) {
        let batch = match decode_batch(validator, raw) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(entity = %self.collection.name(), error = %e, "skipping malformed sync message");
                return;
            }
        };

        let keys = self.collection.key_codec();
        let mut tx = self.collection.begin();
        for event in batch {
            match event {
                SyncEvent::Insert(record) => tx.write(WriteOp::Insert(record)),
                SyncEvent::Update(delta) => tx.write(WriteOp::Update(delta)),
                SyncEvent::Upsert(record) => {
                    if tx.contains(&keys.get_key(&record)) {
                        tx.write(WriteOp::Update(Delta::from_record(&record)));
                    } else {
                        tx.write(WriteOp::Insert(record));
                    }
                }
                SyncEvent::Delete(fields) => tx.write(WriteOp::Delete(fields)),
            }
        }
        tx.commit();
    }
}
