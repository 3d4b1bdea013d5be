//! Stack and tier configuration
//!
//! A [`TierConfiguration`] binds one storage to its capacity policy; a
//! [`StackOptions`] carries the stack-wide knobs. Both validate at
//! construction so an assembled stack never holds an out-of-domain value.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::stack::StackConfigurator;
use crate::storage::{MetaDataStorage, StackableStorage};
use crate::strategy::StrategyKind;

/// One tier: a storage, its item limit, and how much an eviction frees
#[derive(Clone)]
pub struct TierConfiguration {
    name: String,
    storage: Arc<dyn StackableStorage>,
    meta_capable: Arc<dyn MetaDataStorage>,
    item_limit: usize,
    free_rate: f64,
}

impl TierConfiguration {
    /// Create a tier over `storage`, holding at most `item_limit` items.
    /// One eviction pass frees `ceil(item_limit * free_rate)` slots.
    ///
    /// The storage must offer the meta data capability as well, since the
    /// first tier of a stack hosts the meta data blob by default.
    pub fn new<S>(
        name: impl Into<String>,
        storage: Arc<S>,
        item_limit: usize,
        free_rate: f64,
    ) -> Result<Self>
    where
        S: StackableStorage + MetaDataStorage + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Configuration {
                option: "name".to_string(),
                value: name,
                expected: "a non-empty tier name".to_string(),
            });
        }
        if item_limit == 0 {
            return Err(Error::Configuration {
                option: "itemLimit".to_string(),
                value: item_limit.to_string(),
                expected: "an integer greater than zero".to_string(),
            });
        }
        if !(free_rate > 0.0 && free_rate <= 1.0) {
            return Err(Error::Configuration {
                option: "freeRate".to_string(),
                value: free_rate.to_string(),
                expected: "a rate within (0, 1]".to_string(),
            });
        }
        Ok(Self {
            name,
            meta_capable: storage.clone(),
            storage,
            item_limit,
            free_rate,
        })
    }

    /// Tier name, unique within a stack.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tier's backend.
    pub fn storage(&self) -> &dyn StackableStorage {
        self.storage.as_ref()
    }

    /// The same backend through its meta data capability.
    pub(crate) fn meta_storage_handle(&self) -> Arc<dyn MetaDataStorage> {
        self.meta_capable.clone()
    }

    /// Most items the tier may hold.
    pub fn item_limit(&self) -> usize {
        self.item_limit
    }

    /// Fraction of the item limit one eviction pass frees.
    pub fn free_rate(&self) -> f64 {
        self.free_rate
    }

    /// Items one eviction pass removes; at least one, never more than the
    /// item limit.
    pub fn evict_count(&self) -> usize {
        (self.item_limit as f64 * self.free_rate).ceil() as usize
    }
}

impl fmt::Debug for TierConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierConfiguration")
            .field("name", &self.name)
            .field("item_limit", &self.item_limit)
            .field("free_rate", &self.free_rate)
            .finish()
    }
}

/// Stack-wide options
#[derive(Clone, Default)]
pub struct StackOptions {
    /// Replacement strategy applied to every tier
    pub replacement_strategy: StrategyKind,
    /// Where the meta data blob lives; `None` selects the first tier's
    /// storage
    pub meta_storage: Option<Arc<dyn MetaDataStorage>>,
    /// Copy lower-tier restore hits into the tiers above them
    pub bubble_up_on_restore: bool,
    /// One-shot initializer run while the stack is assembled
    pub configurator: Option<Arc<dyn StackConfigurator>>,
}

impl fmt::Debug for StackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackOptions")
            .field("replacement_strategy", &self.replacement_strategy)
            .field("meta_storage", &self.meta_storage.is_some())
            .field("bubble_up_on_restore", &self.bubble_up_on_restore)
            .field("configurator", &self.configurator.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::storage::MemoryStorage;

    use super::*;

    fn make_storage() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::default())
    }

    #[test]
    fn test_valid_tier() {
        let tier = TierConfiguration::new("disk", make_storage(), 100, 0.5).unwrap();
        assert_eq!(tier.name(), "disk");
        assert_eq!(tier.item_limit(), 100);
        assert_eq!(tier.evict_count(), 50);
    }

    #[test]
    fn test_evict_count_rounds_up_and_never_exceeds_limit() {
        let tier = TierConfiguration::new("t", make_storage(), 3, 0.5).unwrap();
        assert_eq!(tier.evict_count(), 2);

        let tier = TierConfiguration::new("t", make_storage(), 1, 0.25).unwrap();
        assert_eq!(tier.evict_count(), 1);

        let tier = TierConfiguration::new("t", make_storage(), 8, 1.0).unwrap();
        assert_eq!(tier.evict_count(), 8);
    }

    #[test]
    fn test_rejects_out_of_domain_values() {
        assert_matches!(
            TierConfiguration::new("", make_storage(), 10, 0.5),
            Err(Error::Configuration { option, .. }) if option == "name"
        );
        assert_matches!(
            TierConfiguration::new("t", make_storage(), 0, 0.5),
            Err(Error::Configuration { option, .. }) if option == "itemLimit"
        );
        for rate in [0.0, -0.5, 1.5, f64::NAN] {
            assert_matches!(
                TierConfiguration::new("t", make_storage(), 10, rate),
                Err(Error::Configuration { option, .. }) if option == "freeRate"
            );
        }
    }

    #[test]
    fn test_default_stack_options() {
        let options = StackOptions::default();
        assert_eq!(options.replacement_strategy, StrategyKind::Lru);
        assert!(options.meta_storage.is_none());
        assert!(!options.bubble_up_on_restore);
        assert!(options.configurator.is_none());
    }
}
