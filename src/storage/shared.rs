//! Connection-style backend with a shared item space
//!
//! Stands in for an out-of-process cache daemon: handles are cheap clones
//! of one connection, every clone sees the same items, and the cooperative
//! lock spans all of them. This is the backend to reach for when several
//! stacks (or several tiers of one stack) must observe each other's writes,
//! and the one that exercises the full lock protocol in tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lock::{LockCoordinator, LockOptions, LockRecord, LockTarget, RecoveredLock};
use crate::meta_data::StackMetaData;
use crate::storage::map::ItemStore;
use crate::storage::{Attributes, MetaDataStorage, Restored, StackableStorage};
use crate::{DEFAULT_META_DATA_KEY, DEFAULT_TTL_SECS};

/// Options for [`SharedMemoryStorage`]
#[derive(Debug, Clone)]
pub struct SharedMemoryStorageOptions {
    /// Host the daemon would listen on
    pub host: String,
    /// Port the daemon would listen on
    pub port: u16,
    /// Keep the connection across handle drops
    pub persistent: bool,
    /// Compress payloads on the wire
    pub compressed: bool,
    /// Item lifetime; `None` means items never expire
    pub ttl: Option<Duration>,
    /// Reserved key for the meta data blob
    pub meta_data_key: String,
    /// Cooperative lock protocol knobs
    pub lock: LockOptions,
}

impl Default for SharedMemoryStorageOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11211,
            persistent: false,
            compressed: false,
            ttl: Some(Duration::from_secs(DEFAULT_TTL_SECS)),
            meta_data_key: DEFAULT_META_DATA_KEY.to_string(),
            lock: LockOptions::default(),
        }
    }
}

impl SharedMemoryStorageOptions {
    /// Check every field against its domain.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Configuration {
                option: "host".to_string(),
                value: self.host.clone(),
                expected: "a non-empty host name".to_string(),
            });
        }
        if self.port == 0 {
            return Err(Error::Configuration {
                option: "port".to_string(),
                value: self.port.to_string(),
                expected: "a non-zero port number".to_string(),
            });
        }
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

/// Handle onto a shared item space; clones share everything
#[derive(Clone)]
pub struct SharedMemoryStorage {
    options: SharedMemoryStorageOptions,
    store: Arc<ItemStore>,
    coordinator: LockCoordinator,
}

impl fmt::Debug for SharedMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryStorage")
            .field("host", &self.options.host)
            .field("port", &self.options.port)
            .field("handles", &Arc::strong_count(&self.store))
            .finish()
    }
}

impl SharedMemoryStorage {
    /// Open a connection with validated options.
    pub fn connect(options: SharedMemoryStorageOptions) -> Result<Self> {
        options.validate()?;
        debug!(
            host = %options.host,
            port = options.port,
            persistent = options.persistent,
            "shared storage connected"
        );
        let coordinator = LockCoordinator::new(options.lock.clone());
        Ok(Self {
            options,
            store: Arc::new(ItemStore::new()),
            coordinator,
        })
    }

    /// Options in effect.
    pub fn options(&self) -> &SharedMemoryStorageOptions {
        &self.options
    }
}

#[async_trait]
impl StackableStorage for SharedMemoryStorage {
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
impl MetaDataStorage for SharedMemoryStorage {
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
impl LockTarget for SharedMemoryStorage {
    async fn try_create_sentinel(&self, key: &str, record: &LockRecord) -> Result<bool> {
        let blob = record.to_bytes()?;
        Ok(self.store.try_put_control(key, blob))
    }

    async fn read_sentinel(&self, key: &str) -> Result<Option<LockRecord>> {
        Ok(self.store.get_control(key).map(|blob| {
            LockRecord::from_bytes(&blob).unwrap_or_else(|| {
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
