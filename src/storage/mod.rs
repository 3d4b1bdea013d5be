//! Storage contracts and the shipped in-process backends
//!
//! - [`StackableStorage`] - the per-tier capability the stack drives:
//!   store/restore/delete plus the purge, count and reset maintenance
//!   surface the replacement strategies rely on
//! - [`MetaDataStorage`] - meta data persistence and cooperative locking;
//!   the stack requires it of whichever storage hosts the meta data blob
//! - [`MemoryStorage`] - process-local reference backend
//! - [`SharedMemoryStorage`] - connection-style backend whose clones share
//!   one item space, standing in for an out-of-process cache daemon
//!
//! Both shipped backends keep item records and control records (meta data
//! blob, lock sentinel) in separate spaces, so reserved keys never collide
//! with item IDs and never appear in counts, purges or search results.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::lock::RecoveredLock;
use crate::meta_data::StackMetaData;

mod map;
mod memory;
mod shared;

pub use memory::{MemoryStorage, MemoryStorageOptions};
pub use shared::{SharedMemoryStorage, SharedMemoryStorageOptions};

/// Ordered attribute map attached to an item
pub type Attributes = BTreeMap<String, String>;

/// A successful restore: the resolved item ID and its payload
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    /// ID of the item that matched
    pub id: String,
    /// Stored payload
    pub data: Bytes,
}

/// Minimal operations a tier backend provides.
///
/// Lookups come in two modes. Exact mode (`search = false`) identifies an
/// item by its ID alone and ignores the attributes entirely. Search mode
/// (`search = true`) treats ID and attributes as a filter over live items:
/// an empty ID matches any ID, a non-empty ID must match exactly, and every
/// supplied attribute must be present with an equal value. A miss is a
/// normal outcome, never an error.
#[async_trait]
pub trait StackableStorage: Send + Sync {
    /// Persist `data` under `id`, overwriting any prior record and
    /// restarting the lifetime used for expiry.
    async fn store(&self, id: &str, data: Bytes, attributes: &Attributes) -> Result<()>;

    /// Look up one item. Returns the resolved ID alongside the payload so
    /// search-mode callers learn which item matched; when several match,
    /// the lexicographically smallest ID wins. Expired items never match.
    async fn restore(
        &self,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Option<Restored>>;

    /// Delete matching items, returning the IDs actually removed.
    async fn delete(&self, id: &str, attributes: &Attributes, search: bool)
        -> Result<Vec<String>>;

    /// Remove every item whose lifetime has elapsed, returning the removed
    /// IDs. Items still alive are untouched.
    async fn purge(&self) -> Result<Vec<String>>;

    /// Number of items physically held, expired or not. Expired items only
    /// leave this count through [`purge`](Self::purge) or deletion.
    async fn count(&self) -> Result<usize>;

    /// Drop every item unconditionally. Control records survive.
    async fn reset(&self) -> Result<()>;
}

/// Meta data persistence and locking capability of a storage.
///
/// The stack keeps its replacement-strategy bookkeeping as one blob under a
/// reserved key in this storage, and brackets every operation with
/// [`lock`](Self::lock)/[`unlock`](Self::unlock) so independent processes
/// sharing the backend serialize their read-modify-write cycles.
#[async_trait]
pub trait MetaDataStorage: Send + Sync {
    /// Write the meta data blob under the reserved key.
    async fn store_meta_data(&self, meta: &StackMetaData) -> Result<()>;

    /// Read the meta data blob, if one has been stored.
    async fn restore_meta_data(&self) -> Result<Option<StackMetaData>>;

    /// Acquire the cooperative lock, waiting for a live holder. Reports a
    /// takeover when an abandoned sentinel had to be broken on the way in.
    async fn lock(&self) -> Result<Option<RecoveredLock>>;

    /// Release the cooperative lock unconditionally.
    async fn unlock(&self) -> Result<()>;
}
