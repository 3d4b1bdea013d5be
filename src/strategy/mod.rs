//! Replacement strategies
//!
//! A strategy decides which items leave a full tier. It owns the layout of
//! the persisted bookkeeping and every read/write of it; the stack hands
//! the loaded blob in and persists whatever comes back. Strategies are
//! stateless values, all state lives in [`StackMetaData`].
//!
//! Before evicting, a strategy always purges expired items first; victims
//! are only taken from what survives the purge. One eviction pass frees
//! `ceil(item_limit * free_rate)` slots so back-to-back stores do not pay
//! an eviction each.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::TierConfiguration;
use crate::error::Result;
use crate::meta_data::StackMetaData;
use crate::storage::{Attributes, Restored};

mod lfu;
mod lru;

pub use lfu::{LfuMetaData, LfuReplacementStrategy};
pub use lru::{LruMetaData, LruReplacementStrategy};

/// Closed set of replacement-strategy variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Evict the least recently touched items first (default)
    #[default]
    Lru,
    /// Evict the least frequently used items first
    Lfu,
}

impl StrategyKind {
    /// Resolve the variant to its implementation.
    pub fn instantiate(self) -> Arc<dyn ReplacementStrategy> {
        match self {
            Self::Lru => Arc::new(LruReplacementStrategy),
            Self::Lfu => Arc::new(LfuReplacementStrategy),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => write!(f, "lru"),
            Self::Lfu => write!(f, "lfu"),
        }
    }
}

/// Eviction policy driving one tier of a cache stack.
///
/// Implementations must check the meta data kind before touching storage,
/// so a kind mismatch never leaves a half-applied operation behind.
#[async_trait]
pub trait ReplacementStrategy: Send + Sync {
    /// Variant this strategy implements.
    fn kind(&self) -> StrategyKind;

    /// Fresh, empty meta data of this strategy's kind.
    fn create_meta_data(&self) -> StackMetaData;

    /// Store one item into a tier, purging and evicting first when the
    /// tier sits at its item limit.
    async fn store(
        &self,
        conf: &TierConfiguration,
        meta: &mut StackMetaData,
        id: &str,
        data: Bytes,
        attributes: &Attributes,
    ) -> Result<()>;

    /// Restore one item from a tier, refreshing its bookkeeping on a hit.
    async fn restore(
        &self,
        conf: &TierConfiguration,
        meta: &mut StackMetaData,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Option<Restored>>;

    /// Delete matching items from a tier, dropping their bookkeeping.
    async fn delete(
        &self,
        conf: &TierConfiguration,
        meta: &mut StackMetaData,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Vec<String>>;
}

// =============================================================================
// Tests
// =============================================================================
