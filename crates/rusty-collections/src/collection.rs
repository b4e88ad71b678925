// File: rusty-collections/src/collection.rs
// Purpose: Reactive collection with optimistic mutations and settle tracking

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::change::{Change, ChangeAction, ChangeOrigin, ChangeSet};
use crate::config::SyncConfig;
use crate::delta::{merge_delta, Delta};
use crate::driver::SyncPhase;
use crate::error::{CollectionError, KeyError, SyncError};
use crate::key::{KeyCodec, KeyFields};
use crate::pacer::{Pacer, PendingRound, RoundResult};
use crate::schema::{fill_zero_fields, EntitySchema, MethodDescriptor};
use crate::transport::Transport;
use crate::value::Record;
use crate::wire::{self, Json};

/// One pending write of a transaction; takes effect at commit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteOp {
    Insert(Record),
    Update(Delta),
    Delete(KeyFields),
}

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Pending,
    Ready,
    Failed(SyncError),
}

struct Inner {
    schema: Arc<EntitySchema>,
    keys: KeyCodec,
    transport: Arc<dyn Transport>,
    config: Arc<SyncConfig>,
    items: RwLock<BTreeMap<String, Record>>,
    changes: broadcast::Sender<Arc<ChangeSet>>,
    last_sync: watch::Sender<Option<DateTime<Utc>>>,
    readiness: watch::Sender<Readiness>,
    phase: watch::Sender<SyncPhase>,
    pacer: Pacer,
}

/// In-memory store of one entity type, kept in step with the server.
///
/// Cloning is cheap; clones share the same store.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("entity", &self.name())
            .field("len", &self.len())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Collection {
    pub fn new(
        schema: Arc<EntitySchema>,
        transport: Arc<dyn Transport>,
        config: Arc<SyncConfig>,
    ) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                keys: KeyCodec::new(&schema),
                schema,
                transport,
                config,
                items: RwLock::new(BTreeMap::new()),
                changes,
                last_sync: watch::Sender::new(None),
                readiness: watch::Sender::new(Readiness::Pending),
                phase: watch::Sender::new(SyncPhase::Idle),
                pacer: Pacer::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.schema.name()
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.inner.schema
    }

    pub fn key_codec(&self) -> &KeyCodec {
        &self.inner.keys
    }

    /// Local read; never touches the network.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.inner.items.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.items.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    /// Every stored entity, in key order.
    pub fn values(&self) -> Vec<Record> {
        self.inner.items.read().values().cloned().collect()
    }

    /// Subscribe to change sets published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeSet>> {
        self.inner.changes.subscribe()
    }

    /// Change sets as a stream; sets lost to a slow consumer are skipped.
    pub fn changes(&self) -> BoxStream<'static, Arc<ChangeSet>> {
        let entity = self.name().to_string();
        BroadcastStream::new(self.subscribe())
            .filter_map(move |item| {
                let entity = entity.clone();
                async move {
                    match item {
                        Ok(set) => Some(set),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            tracing::warn!(entity = %entity, skipped, "change feed lagged");
                            None
                        }
                    }
                }
            })
            .boxed()
    }

    /// Wall-clock time of the last committed sync batch.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_sync.borrow()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    /// Resolves once the first snapshot has been committed.
    ///
    /// Fails if the driver stops before that happens, with
    /// [`SyncError::Cancelled`] after a teardown. A snapshot fetch that never
    /// resolves keeps this pending.
    pub async fn ready(&self) -> Result<(), SyncError> {
        let mut rx = self.inner.readiness.subscribe();
        let readiness = rx
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map(|r| r.clone())
            .unwrap_or(Readiness::Failed(SyncError::StreamEnded));

        match readiness {
            Readiness::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Optimistically add entities, then send them to the server.
    ///
    /// Declared fields missing from an item are stored locally as their zero
    /// value, the same shape a snapshot entity has; the RPC carries the item
    /// as given.
    pub async fn insert(&self, items: Vec<Record>) -> Result<(), CollectionError> {
        let method = self.mutation_method(self.inner.schema.insert_method(), "insert")?;
        let writes = self.keyed(items, |item, keys| {
            Ok((keys.require_key(&item)?, WriteOp::Insert(item)))
        })?;
        self.mutate(&method, writes).await
    }

    /// Optimistically merge deltas, then send them to the server.
    pub async fn update(&self, items: Vec<Delta>) -> Result<(), CollectionError> {
        let method = self.mutation_method(self.inner.schema.update_method(), "update")?;
        let writes = self.keyed(items, |delta, keys| {
            Ok((keys.require_key(&delta)?, WriteOp::Update(delta)))
        })?;
        self.mutate(&method, writes).await
    }

    /// Optimistically remove entities by key fields, then tell the server.
    pub async fn delete(&self, items: Vec<KeyFields>) -> Result<(), CollectionError> {
        let method = self.mutation_method(self.inner.schema.delete_method(), "delete")?;
        let writes = self.keyed(items, |fields, keys| {
            Ok((keys.require_key(&fields)?, WriteOp::Delete(fields)))
        })?;
        self.mutate(&method, writes).await
    }

    /// Like [`update`](Self::update), but calls landing in the same pace
    /// window for a key go out as one RPC carrying the accumulated delta.
    ///
    /// Local state still changes on every call.
    pub async fn update_paced(&self, items: Vec<Delta>) -> Result<(), CollectionError> {
        self.mutation_method(self.inner.schema.update_method(), "update")?;
        let deltas = items
            .into_iter()
            .map(|delta| Ok((self.inner.keys.require_key(&delta)?, delta)))
            .collect::<Result<Vec<_>, KeyError>>()?;

        let rounds = deltas
            .iter()
            .map(|(key, delta)| {
                let enqueued = self.inner.pacer.enqueue(key.clone(), delta.clone());
                if let Some(round) = enqueued.displaced {
                    self.send_displaced(round);
                }
                if enqueued.opens_window {
                    self.arm_pace_timer(key.clone());
                }
                enqueued.receiver
            })
            .collect::<Vec<_>>();
        self.inner.apply_local(
            deltas
                .into_iter()
                .map(|(key, delta)| (key, WriteOp::Update(delta)))
                .collect(),
        );

        let mut sent_at = None;
        for round in join_all(rounds).await {
            let at = round.map_err(|_| CollectionError::Closed)??;
            sent_at = sent_at.max(Some(at));
        }

        match sent_at {
            Some(at) => self.wait_for_sync(at).await,
            None => Ok(()),
        }
    }

    /// Number of keys with a paced round waiting for its window to close.
    pub fn pending_paced(&self) -> usize {
        self.inner.pacer.len()
    }

    /// Send every pending paced round now.
    pub async fn flush_paced(&self) -> Result<(), CollectionError> {
        let rounds = self.inner.pacer.take_all();
        if rounds.is_empty() {
            return Ok(());
        }

        tracing::debug!(entity = %self.name(), rounds = rounds.len(), "flushing paced updates");
        let results = join_all(rounds.into_iter().map(|(_, round)| self.send_round(round))).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Resolve once a sync batch committed after `t0`.
    ///
    /// Bounded by the configured settle timeout; fails fast once the driver
    /// has stopped.
    pub async fn wait_for_sync(&self, t0: DateTime<Utc>) -> Result<(), CollectionError> {
        match self.inner.config.settle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.synced_after(t0))
                .await
                .map_err(|_| CollectionError::SettleTimeout {
                    entity: self.name().to_string(),
                    waited: limit,
                })?,
            None => self.synced_after(t0).await,
        }
    }

    async fn synced_after(&self, t0: DateTime<Utc>) -> Result<(), CollectionError> {
        let mut last_sync = self.inner.last_sync.subscribe();
        let mut phase = self.inner.phase.subscribe();

        tokio::select! {
            biased;

            synced = last_sync.wait_for(|last| last.is_some_and(|at| at > t0)) => {
                synced.map(|_| ()).map_err(|_| CollectionError::Closed)
            }
            stopped = phase.wait_for(|phase| phase.is_terminal()) => {
                let phase = stopped.map(|p| *p).map_err(|_| CollectionError::Closed)?;
                Err(CollectionError::Unsynced {
                    entity: self.name().to_string(),
                    phase,
                })
            }
        }
    }

    fn mutation_method(
        &self,
        method: Option<&MethodDescriptor>,
        operation: &'static str,
    ) -> Result<MethodDescriptor, CollectionError> {
        method.cloned().ok_or_else(|| CollectionError::Unsupported {
            entity: self.name().to_string(),
            operation,
        })
    }

    fn keyed<T>(
        &self,
        items: Vec<T>,
        f: impl Fn(T, &KeyCodec) -> Result<(String, WriteOp), KeyError>,
    ) -> Result<Vec<(String, WriteOp)>, CollectionError> {
        items
            .into_iter()
            .map(|item| f(item, &self.inner.keys).map_err(CollectionError::from))
            .collect()
    }

    async fn mutate(
        &self,
        method: &MethodDescriptor,
        writes: Vec<(String, WriteOp)>,
    ) -> Result<(), CollectionError> {
        let t0 = Utc::now();
        let payload = json!({
            "items": writes.iter().map(|(_, op)| self.encode(op)).collect::<Vec<_>>(),
        });
        self.inner.apply_local(writes);

        self.inner.transport.unary(method, payload).await?;
        self.wait_for_sync(t0).await
    }

    fn encode(&self, op: &WriteOp) -> Json {
        let schema = &self.inner.schema;
        match op {
            WriteOp::Insert(record) | WriteOp::Delete(record) => wire::encode_record(schema, record),
            WriteOp::Update(delta) => {
                wire::encode_delta(schema, delta, &self.inner.config.unset_sentinel)
            }
        }
    }

    fn arm_pace_timer(&self, key: String) {
        let weak = Arc::downgrade(&self.inner);
        let window = self.inner.config.pace_window;
        let task_key = key.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let collection = Collection { inner };
            if let Some(round) = collection.inner.pacer.take(&task_key) {
                collection.send_logged(round).await;
            }
        });
        self.inner.pacer.arm(&key, timer);
    }

    /// Send a round whose window was closed early by an unfoldable call.
    ///
    /// The newer round for the key waits for this one before its RPC goes out.
    fn send_displaced(&self, round: PendingRound) {
        let collection = self.clone();
        tokio::spawn(async move {
            collection.send_logged(round).await;
        });
    }

    /// Send a round no caller may be left to hear about.
    async fn send_logged(&self, round: PendingRound) {
        let key = round.key().to_string();
        if let Err(e) = self.send_round(round).await {
            tracing::warn!(entity = %self.name(), key = %key, error = %e, "paced update failed");
        }
    }

    async fn send_round(&self, mut round: PendingRound) -> Result<(), CollectionError> {
        round.wait_turn().await;
        let result: RoundResult = match self.inner.schema.update_method() {
            Some(method) => {
                let payload = json!({ "items": [self.encode(&WriteOp::Update(round.delta().clone()))] });
                let sent_at = Utc::now();
                self.inner
                    .transport
                    .unary(method, payload)
                    .await
                    .map(|_| sent_at)
                    .map_err(CollectionError::from)
            }
            None => Err(CollectionError::Unsupported {
                entity: self.name().to_string(),
                operation: "update",
            }),
        };

        let (key, seq) = round.settle(&result);
        self.inner.pacer.release(&key, seq);
        result.map(|_| ())
    }

    /// Start a sync transaction.
    pub(crate) fn begin(&self) -> Transaction<'_> {
        Transaction {
            collection: self,
            writes: Vec::new(),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        self.inner.phase.send_replace(phase);
    }

    pub(crate) fn mark_ready(&self) {
        self.inner.readiness.send_if_modified(|r| match r {
            Readiness::Pending => {
                *r = Readiness::Ready;
                true
            }
            _ => false,
        });
    }

    /// Record a driver failure; only matters while still waiting for readiness.
    pub(crate) fn mark_failed(&self, error: SyncError) {
        self.inner.readiness.send_if_modified(|r| match r {
            Readiness::Pending => {
                *r = Readiness::Failed(error);
                true
            }
            _ => false,
        });
    }
}

impl Inner {
    /// Apply writes under one write lock and publish what changed.
    fn apply(&self, writes: Vec<(String, WriteOp)>, origin: ChangeOrigin) -> Vec<Change> {
        let entity = self.schema.name();
        let mut changes = Vec::with_capacity(writes.len());

        {
            let mut items = self.items.write();
            for (key, op) in writes {
                match op {
                    WriteOp::Insert(mut record) => {
                        tracing::trace!(entity, key = %key, "insert");
                        fill_zero_fields(self.schema.fields(), &mut record);
                        items.insert(key.clone(), record.clone());
                        changes.push(Change {
                            key,
                            action: ChangeAction::Insert,
                            value: Some(record),
                        });
                    }
                    WriteOp::Update(delta) => match items.get_mut(&key) {
                        Some(current) => {
                            tracing::trace!(entity, key = %key, fields = delta.len(), "update");
                            merge_delta(current, &delta);
                            // Messages created by the merge get their declared fields.
                            fill_zero_fields(self.schema.fields(), current);
                            changes.push(Change {
                                key,
                                action: ChangeAction::Update,
                                value: Some(current.clone()),
                            });
                        }
                        None if origin == ChangeOrigin::Sync => {
                            tracing::warn!(entity, key = %key, "discarding update for missing key");
                        }
                        None => {
                            tracing::trace!(entity, key = %key, "no local copy to update");
                        }
                    },
                    WriteOp::Delete(_) => {
                        tracing::trace!(entity, key = %key, "delete");
                        if items.remove(&key).is_some() {
                            changes.push(Change {
                                key,
                                action: ChangeAction::Delete,
                                value: None,
                            });
                        }
                    }
                }
            }
        }

        changes
    }

    /// Optimistic write: visible at once, never advances the last sync time.
    fn apply_local(&self, writes: Vec<(String, WriteOp)>) {
        let changes = self.apply(writes, ChangeOrigin::Local);
        self.publish(ChangeOrigin::Local, Utc::now(), changes);
    }

    fn publish(&self, origin: ChangeOrigin, at: DateTime<Utc>, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let set = Arc::new(ChangeSet {
            entity: self.schema.name().to_string(),
            origin,
            at,
            changes,
        });
        // No subscribers is fine.
        let _ = self.changes.send(set);
    }

    /// Advance the last sync time, strictly increasing.
    fn stamp_sync(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut stamped = now;
        self.last_sync.send_modify(|last| {
            if let Some(previous) = *last {
                if previous >= now {
                    stamped = previous + chrono::Duration::nanoseconds(1);
                }
            }
            *last = Some(stamped);
        });
        stamped
    }
}

/// Writes collected by the sync driver for one received message.
pub(crate) struct Transaction<'a> {
    collection: &'a Collection,
    writes: Vec<(String, WriteOp)>,
}

impl Transaction<'_> {
    pub(crate) fn write(&mut self, op: WriteOp) {
        let keys = &self.collection.inner.keys;
        let key = match &op {
            WriteOp::Insert(record) | WriteOp::Delete(record) => keys.get_key(record),
            WriteOp::Update(delta) => keys.get_key(delta),
        };
        self.writes.push((key, op));
    }

    /// Whether `key` exists once the writes so far are applied.
    pub(crate) fn contains(&self, key: &str) -> bool {
        for (pending, op) in self.writes.iter().rev() {
            if pending != key {
                continue;
            }
            match op {
                WriteOp::Insert(_) => return true,
                WriteOp::Delete(_) => return false,
                WriteOp::Update(_) => {}
            }
        }
        self.collection.contains(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.writes.len()
    }

    /// Apply every write atomically and stamp the last sync time.
    pub(crate) fn commit(self) -> DateTime<Utc> {
        let inner = &self.collection.inner;
        let ops = self.writes.len();
        let changes = inner.apply(self.writes, ChangeOrigin::Sync);
        let at = inner.stamp_sync();

        tracing::debug!(
            entity = %inner.schema.name(),
            ops,
            changed = changes.len(),
            "committed sync batch"
        );
        inner.publish(ChangeOrigin::Sync, at, changes);
        at
    }
}
