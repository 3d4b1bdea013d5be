//! Multi-tier caching with pluggable replacement strategies
//!
//! stratacache arranges several cache storages into a prioritized stack
//! behind the store/restore/delete surface of a single storage. Writes go
//! through every tier, reads scan top-down and stop at the first hit, and
//! a replacement strategy keeps each tier inside its configured item limit
//! by purging expired items first and evicting tracked ones only when that
//! is not enough.
//!
//! ```text
//!              CacheStack
//!       store | restore | delete
//!    +--------v---------v--------+
//!    | tier 0  (fast, small)     |  highest priority
//!    +---------------------------+
//!    | tier 1  (slower, bigger)  |
//!    +---------------------------+
//!    | tier n  ...               |  lowest priority
//!    +---------------------------+
//!      meta data blob + lock
//!      (tier 0's storage unless
//!       configured otherwise)
//! ```
//!
//! Strategy bookkeeping is persisted as one blob next to the cached items
//! and every stack operation runs under a cooperative lock, so independent
//! processes sharing a backend stay consistent.
//!
//! # Modules
//!
//! - [`stack`] - the orchestrator, its builder and the event side-channel
//! - [`strategy`] - LRU and LFU replacement with persisted bookkeeping
//! - [`storage`] - storage contracts and the shipped in-process backends
//! - [`lock`] - cooperative lock protocol with abandoned-lock recovery
//! - [`config`] - tier and stack configuration
//! - [`meta_data`] - the persisted bookkeeping blob
//! - [`error`] - error and result types

pub mod config;
pub mod error;
pub mod lock;
pub mod meta_data;
pub mod stack;
pub mod storage;
pub mod strategy;

mod proptest;

// Re-export commonly used types
pub use config::{StackOptions, TierConfiguration};
pub use error::{Error, Result, TierFault};
pub use lock::{LockCoordinator, LockOptions, LockRecord, LockTarget, RecoveredLock};
pub use meta_data::StackMetaData;
pub use stack::{
    CacheStack, CacheStackBuilder, EVENT_BUFFER_LIMIT, StackConfigurator, StackEvent,
};
pub use storage::{
    Attributes, MemoryStorage, MemoryStorageOptions, MetaDataStorage, Restored,
    SharedMemoryStorage, SharedMemoryStorageOptions, StackableStorage,
};
pub use strategy::{
    LfuMetaData, LfuReplacementStrategy, LruMetaData, LruReplacementStrategy,
    ReplacementStrategy, StrategyKind,
};

// =============================================================================
// Defaults
// =============================================================================

/// Reserved key the lock sentinel lives under by default
pub const DEFAULT_LOCK_KEY: &str = ".lock";

/// Default poll interval while waiting on a held lock, in microseconds
pub const DEFAULT_LOCK_WAIT_MICROS: u64 = 200_000;

/// Default age after which a lock sentinel counts as abandoned, in seconds
pub const DEFAULT_MAX_LOCK_SECS: u64 = 5;

/// Reserved key the meta data blob lives under by default
pub const DEFAULT_META_DATA_KEY: &str = ".metaData";

/// Default item lifetime for the shipped backends, in seconds
pub const DEFAULT_TTL_SECS: u64 = 86_400;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_keys_are_distinct() {
        assert_ne!(DEFAULT_LOCK_KEY, DEFAULT_META_DATA_KEY);
        assert!(DEFAULT_LOCK_KEY.starts_with('.'));
        assert!(DEFAULT_META_DATA_KEY.starts_with('.'));
    }

    #[test]
    fn test_default_timings() {
        assert_eq!(DEFAULT_LOCK_WAIT_MICROS, 200_000);
        assert_eq!(DEFAULT_MAX_LOCK_SECS, 5);
        assert_eq!(DEFAULT_TTL_SECS, 86_400);
    }
}
