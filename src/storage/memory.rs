//! Process-local storage backend
//!
//! Reference implementation of the storage contracts over a pair of
//! concurrent maps. Every [`MemoryStorage`] owns its item space, making it
//! the natural backend for per-process tiers and for tests. It fulfils all
//! three contracts at once, so a single instance can both carry a tier and
//! host the stack's meta data blob.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{Error, Result};
use crate::lock::{LockCoordinator, LockOptions, LockRecord, LockTarget, RecoveredLock};
use crate::meta_data::StackMetaData;
use crate::storage::map::ItemStore;
use crate::storage::{Attributes, MetaDataStorage, Restored, StackableStorage};
use crate::{DEFAULT_META_DATA_KEY, DEFAULT_TTL_SECS};

/// Options for [`MemoryStorage`]
#[derive(Debug, Clone)]
pub struct MemoryStorageOptions {
    /// Item lifetime; `None` means items never expire
    pub ttl: Option<Duration>,
    /// Reserved key for the meta data blob
    pub meta_data_key: String,
    /// Cooperative lock protocol knobs
    pub lock: LockOptions,
}

impl Default for MemoryStorageOptions {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(DEFAULT_TTL_SECS)),
            meta_data_key: DEFAULT_META_DATA_KEY.to_string(),
            lock: LockOptions::default(),
        }
    }
}

impl MemoryStorageOptions {
    /// Check every field against its domain.
    pub fn validate(&self) -> Result<()> {
        if self.meta_data_key.is_empty() {
            return Err(Error::Configuration {
                option: "metaDataKey".to_string(),
                value: self.meta_data_key.clone(),
                expected: "a non-empty reserved key".to_string(),
            });
        }
        self.lock.validate()?;
        if self.meta_data_key == self.lock.lock_key {
            return Err(Error::Configuration {
                option: "metaDataKey".to_string(),
                value: self.meta_data_key.clone(),
                expected: "a reserved key distinct from lockKey".to_string(),
            });
        }
        Ok(())
    }
}

/// Process-local backend implementing [`StackableStorage`],
/// [`MetaDataStorage`] and [`LockTarget`]
#[derive(Debug)]
pub struct MemoryStorage {
    options: MemoryStorageOptions,
    store: ItemStore,
    coordinator: LockCoordinator,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            options: MemoryStorageOptions::default(),
            store: ItemStore::new(),
            coordinator: LockCoordinator::new(LockOptions::default()),
        }
    }
}

impl MemoryStorage {
    /// Create a backend with validated options.
    pub fn new(options: MemoryStorageOptions) -> Result<Self> {
        options.validate()?;
        let coordinator = LockCoordinator::new(options.lock.clone());
        Ok(Self {
            options,
            store: ItemStore::new(),
            coordinator,
        })
    }

    /// Options in effect.
    pub fn options(&self) -> &MemoryStorageOptions {
        &self.options
    }
}

#[async_trait]
impl StackableStorage for MemoryStorage {
    async fn store(&self, id: &str, data: Bytes, attributes: &Attributes) -> Result<()> {
        self.store.store(id, data, attributes);
        Ok(())
    }

    async fn restore(
        &self,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Option<Restored>> {
        Ok(self.store.restore(self.options.ttl, id, attributes, search))
    }

    async fn delete(
        &self,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Vec<String>> {
        Ok(self.store.delete(self.options.ttl, id, attributes, search))
    }

    async fn purge(&self) -> Result<Vec<String>> {
        Ok(self.store.purge(self.options.ttl))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.store.count())
    }

    async fn reset(&self) -> Result<()> {
        self.store.clear_items();
        Ok(())
    }
}

#[async_trait]
impl MetaDataStorage for MemoryStorage {
    async fn store_meta_data(&self, meta: &StackMetaData) -> Result<()> {
        let blob = meta.to_bytes()?;
        self.store.put_control(&self.options.meta_data_key, blob);
        Ok(())
    }

    async fn restore_meta_data(&self) -> Result<Option<StackMetaData>> {
        match self.store.get_control(&self.options.meta_data_key) {
            Some(blob) => StackMetaData::from_bytes(&blob).map(Some),
            None => Ok(None),
        }
    }

    async fn lock(&self) -> Result<Option<RecoveredLock>> {
        self.coordinator.acquire(self).await
    }

    async fn unlock(&self) -> Result<()> {
        self.coordinator.release(self).await
    }
}

#[async_trait]
impl LockTarget for MemoryStorage {
    async fn try_create_sentinel(&self, key: &str, record: &LockRecord) -> Result<bool> {
        let blob = record.to_bytes()?;
        Ok(self.store.try_put_control(key, blob))
    }

    async fn read_sentinel(&self, key: &str) -> Result<Option<LockRecord>> {
        Ok(self.store.get_control(key).map(|blob| {
            LockRecord::from_bytes(&blob).unwrap_or_else(|| {
                // Undecodable sentinels count as abandoned since forever.
                warn!(lock_key = %key, "undecodable lock sentinel treated as abandoned");
                LockRecord {
                    acquired_at: DateTime::<Utc>::MIN_UTC,
                }
            })
        }))
    }

    async fn clear_sentinel(&self, key: &str) -> Result<()> {
        self.store.remove_control(key);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::strategy::{LruMetaData, StrategyKind};

    use super::*;

    fn eternal() -> MemoryStorage {
        MemoryStorage::new(MemoryStorageOptions {
            ttl: None,
            ..Default::default()
        })
        .unwrap()
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_options() {
        let options = MemoryStorageOptions::default();
        assert_eq!(options.ttl, Some(Duration::from_secs(86_400)));
        assert_eq!(options.meta_data_key, ".metaData");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_reserved_keys_must_differ() {
        let options = MemoryStorageOptions {
            meta_data_key: ".lock".to_string(),
            ..Default::default()
        };
        assert_matches!(
            MemoryStorage::new(options),
            Err(Error::Configuration { option, .. }) if option == "metaDataKey"
        );

        let options = MemoryStorageOptions {
            meta_data_key: String::new(),
            ..Default::default()
        };
        assert_matches!(MemoryStorage::new(options), Err(Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_store_restore_delete_cycle() {
        let storage = eternal();
        let none = Attributes::new();

        storage
            .store("page-1", Bytes::from_static(b"<html>"), &none)
            .await
            .unwrap();
        let found = storage.restore("page-1", &none, false).await.unwrap().unwrap();
        assert_eq!(found.id, "page-1");
        assert_eq!(found.data, Bytes::from_static(b"<html>"));

        assert_eq!(
            storage.delete("page-1", &none, false).await.unwrap(),
            vec!["page-1".to_string()]
        );
        assert!(storage.restore("page-1", &none, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_restarts_lifetime() {
        let storage = MemoryStorage::new(MemoryStorageOptions {
            ttl: Some(Duration::from_secs(3600)),
            ..Default::default()
        })
        .unwrap();
        let none = Attributes::new();

        storage.store("k", Bytes::from_static(b"v1"), &none).await.unwrap();
        storage
            .store("k", Bytes::from_static(b"v2"), &attrs(&[("lang", "en")]))
            .await
            .unwrap();

        assert_eq!(storage.count().await.unwrap(), 1);
        let found = storage
            .restore("", &attrs(&[("lang", "en")]), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.data, Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_expired_restore_misses_without_removing() {
        let storage = MemoryStorage::new(MemoryStorageOptions {
            ttl: Some(Duration::ZERO),
            ..Default::default()
        })
        .unwrap();
        let none = Attributes::new();

        storage.store("stale", Bytes::from_static(b"x"), &none).await.unwrap();
        assert!(storage.restore("stale", &none, false).await.unwrap().is_none());
        assert_eq!(storage.count().await.unwrap(), 1);

        assert_eq!(storage.purge().await.unwrap(), vec!["stale".to_string()]);
        assert_eq!(storage.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_keeps_control_records() {
        let storage = eternal();
        let meta = StackMetaData::Lru(LruMetaData::default());
        storage.store_meta_data(&meta).await.unwrap();
        storage
            .store("item", Bytes::from_static(b"x"), &Attributes::new())
            .await
            .unwrap();

        storage.reset().await.unwrap();
        assert_eq!(storage.count().await.unwrap(), 0);
        assert_eq!(storage.restore_meta_data().await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_meta_data_round_trip_and_kind() {
        let storage = eternal();
        assert!(storage.restore_meta_data().await.unwrap().is_none());

        let mut inner = LruMetaData::default();
        inner.touch("mem", "item-1");
        storage.store_meta_data(&StackMetaData::Lru(inner)).await.unwrap();

        let loaded = storage.restore_meta_data().await.unwrap().unwrap();
        assert_eq!(loaded.kind(), StrategyKind::Lru);
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let storage = eternal();
        assert!(storage.lock().await.unwrap().is_none());
        storage.unlock().await.unwrap();
        assert!(storage.lock().await.unwrap().is_none());
        storage.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_sentinel_reads_as_abandoned() {
        let storage = eternal();
        storage.store.put_control(".lock", Bytes::from_static(b"???"));

        let record = storage.read_sentinel(".lock").await.unwrap().unwrap();
        assert_eq!(record.acquired_at, DateTime::<Utc>::MIN_UTC);

        // The coordinator therefore breaks it and acquires.
        let recovered = storage.lock().await.unwrap().unwrap();
        assert_eq!(recovered.lock_key, ".lock");
        storage.unlock().await.unwrap();
    }
}
