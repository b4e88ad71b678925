// File: rusty-collections/src/registry.rs
// Purpose: One collection and sync driver per catalog entity

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collection::Collection;
use crate::config::SyncConfig;
use crate::driver::SyncDriver;
use crate::error::{RegistryError, SyncError};
use crate::schema::SchemaCatalog;
use crate::transport::Transport;

type DriverHandle = (String, JoinHandle<Result<(), SyncError>>);

/// Owns every collection of an application.
///
/// Created once at startup with [`start`](Self::start) and torn down with
/// [`shutdown`](Self::shutdown). Dropping the registry cancels all drivers
/// without waiting for them.
pub struct CollectionRegistry {
    collections: BTreeMap<String, Collection>,
    drivers: Mutex<Vec<DriverHandle>>,
    cancel: CancellationToken,
}

impl CollectionRegistry {
    /// Build a collection per entity and spawn its driver.
    pub fn start(catalog: &SchemaCatalog, transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let mut collections = BTreeMap::new();
        let mut drivers = Vec::with_capacity(catalog.len());
        for schema in catalog.iter() {
            let name = schema.name().to_string();
            let collection = Collection::new(schema.clone(), transport.clone(), config.clone());
            let handle = SyncDriver::new(collection.clone(), cancel.child_token()).spawn();

            drivers.push((name.clone(), handle));
            collections.insert(name, collection);
        }

        tracing::info!(
            collections = collections.len(),
            transport = transport.name(),
            "collection registry started"
        );

        Self {
            collections,
            drivers: Mutex::new(drivers),
            cancel,
        }
    }

    pub fn get(&self, entity: &str) -> Option<&Collection> {
        self.collections.get(entity)
    }

    pub fn collection(&self, entity: &str) -> Result<&Collection, RegistryError> {
        self.get(entity)
            .ok_or_else(|| RegistryError::UnknownEntity(entity.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Collection)> {
        self.collections.iter().map(|(name, c)| (name.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Resolves once every collection has committed its first snapshot.
    ///
    /// Blocks for as long as any snapshot is outstanding.
    pub async fn ready(&self) -> Result<(), RegistryError> {
        try_join_all(self.collections.iter().map(|(entity, collection)| async move {
            collection.ready().await.map_err(|source| RegistryError::Sync {
                entity: entity.clone(),
                source,
            })
        }))
        .await?;

        tracing::info!(collections = self.collections.len(), "all collections ready");
        Ok(())
    }

    /// Flush paced updates, cancel every driver and wait for them to exit.
    ///
    /// Reports the first failure; later ones are only logged.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let mut first = None;

        for (entity, collection) in &self.collections {
            if let Err(source) = collection.flush_paced().await {
                tracing::warn!(entity = %entity, error = %source, "failed to flush paced updates");
                first.get_or_insert(RegistryError::Flush {
                    entity: entity.clone(),
                    source,
                });
            }
        }

        self.cancel.cancel();

        let drivers = std::mem::take(&mut *self.drivers.lock());
        for (entity, handle) in drivers {
            let failure = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => RegistryError::Sync { entity, source },
                Err(e) => RegistryError::Driver {
                    entity,
                    reason: e.to_string(),
                },
            };
            tracing::warn!(error = %failure, "driver did not stop cleanly");
            first.get_or_insert(failure);
        }

        tracing::info!("collection registry shut down");
        first.map_or(Ok(()), Err)
    }
}

impl Drop for CollectionRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
