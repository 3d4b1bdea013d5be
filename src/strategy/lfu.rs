//! Least-frequently-used replacement
//!
//! Counts uses instead of recency: every store and every restore hit adds
//! one to an item's hit count, and a full tier sheds the items with the
//! fewest hits. Ties go to the entry with the older sequence number, so of
//! two equally popular items the longer-resident one leaves first.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TierConfiguration;
use crate::error::{Error, Result};
use crate::meta_data::StackMetaData;
use crate::storage::{Attributes, Restored};
use crate::strategy::{ReplacementStrategy, StrategyKind};

/// One item's use counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LfuEntry {
    /// Uses recorded so far
    hits: u64,
    /// Claimed at first insertion and kept across overwrites
    sequence: u64,
}

/// Frequency bookkeeping, sectioned per tier and keyed by tier name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LfuMetaData {
    /// Next value of the shared sequence counter
    next_sequence: u64,
    /// Per-tier counter maps
    tiers: BTreeMap<String, BTreeMap<String, LfuEntry>>,
}

impl LfuMetaData {
    /// Record a use for `id` in `tier`, creating the counter at one use if
    /// it does not exist yet.
    pub(crate) fn record_use(&mut self, tier: &str, id: &str) {
        let next_sequence = &mut self.next_sequence;
        self.tiers
            .entry(tier.to_string())
            .or_default()
            .entry(id.to_string())
            .and_modify(|entry| entry.hits += 1)
            .or_insert_with(|| {
                let sequence = *next_sequence;
                *next_sequence += 1;
                LfuEntry { hits: 1, sequence }
            });
    }

    /// Drop the counters for `ids` in `tier`.
    pub(crate) fn remove(&mut self, tier: &str, ids: &[String]) {
        if let Some(entries) = self.tiers.get_mut(tier) {
            for id in ids {
                entries.remove(id);
            }
        }
    }

    /// Least-used IDs in `tier`, fewest hits first, at most `count`.
    pub(crate) fn victims(&self, tier: &str, count: usize) -> Vec<String> {
        let entries = match self.tiers.get(tier) {
            Some(entries) => entries,
            None => return Vec::new(),
        };
        let mut ordered: Vec<(&String, &LfuEntry)> = entries.iter().collect();
        ordered.sort_by_key(|(_, entry)| (entry.hits, entry.sequence));
        ordered
            .into_iter()
            .take(count)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of tracked IDs in `tier`.
    pub fn tracked(&self, tier: &str) -> usize {
        self.tiers.get(tier).map_or(0, |entries| entries.len())
    }

    /// Hits recorded for `id` in `tier`, if tracked.
    pub fn hits(&self, tier: &str, id: &str) -> Option<u64> {
        self.tiers
            .get(tier)
            .and_then(|entries| entries.get(id))
            .map(|entry| entry.hits)
    }
}

/// The least-frequently-used strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuReplacementStrategy;

impl LfuReplacementStrategy {
    fn meta_mut<'a>(&self, meta: &'a mut StackMetaData) -> Result<&'a mut LfuMetaData> {
        match meta {
            StackMetaData::Lfu(inner) => Ok(inner),
            other => Err(Error::InvalidMetaDataKind {
                expected: StrategyKind::Lfu.to_string(),
                actual: other.kind().to_string(),
            }),
        }
    }
}

#[async_trait]
impl ReplacementStrategy for LfuReplacementStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lfu
    }

    fn create_meta_data(&self) -> StackMetaData {
        StackMetaData::Lfu(LfuMetaData::default())
    }

    async fn store(
        &self,
        conf: &TierConfiguration,
        meta: &mut StackMetaData,
        id: &str,
        data: Bytes,
        attributes: &Attributes,
    ) -> Result<()> {
        let meta = self.meta_mut(meta)?;

        if conf.storage().count().await? >= conf.item_limit() {
            let purged = conf.storage().purge().await?;
            meta.remove(conf.name(), &purged);

            if conf.storage().count().await? >= conf.item_limit() {
                let victims = meta.victims(conf.name(), conf.evict_count());
                debug!(
                    tier = %conf.name(),
                    count = victims.len(),
                    "evicting least frequently used items"
                );
                let none = Attributes::new();
                for victim in &victims {
                    conf.storage().delete(victim, &none, false).await?;
                }
                meta.remove(conf.name(), &victims);
            }
        }

        conf.storage().store(id, data, attributes).await?;
        meta.record_use(conf.name(), id);
        Ok(())
    }

    async fn restore(
        &self,
        conf: &TierConfiguration,
        meta: &mut StackMetaData,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Option<Restored>> {
        let meta = self.meta_mut(meta)?;
        let found = conf.storage().restore(id, attributes, search).await?;
        if let Some(hit) = &found {
            meta.record_use(conf.name(), &hit.id);
        }
        Ok(found)
    }

    async fn delete(
        &self,
        conf: &TierConfiguration,
        meta: &mut StackMetaData,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Vec<String>> {
        let meta = self.meta_mut(meta)?;
        let deleted = conf.storage().delete(id, attributes, search).await?;
        meta.remove(conf.name(), &deleted);
        Ok(deleted)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use crate::storage::{MemoryStorage, MemoryStorageOptions, StackableStorage};
    use crate::strategy::LruMetaData;

    use super::*;

    fn eternal_storage() -> Arc<MemoryStorage> {
        Arc::new(
            MemoryStorage::new(MemoryStorageOptions {
                ttl: None,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn make_tier(storage: Arc<MemoryStorage>, limit: usize, rate: f64) -> TierConfiguration {
        TierConfiguration::new("t", storage, limit, rate).unwrap()
    }

    fn lfu_inner(meta: &StackMetaData) -> &LfuMetaData {
        match meta {
            StackMetaData::Lfu(inner) => inner,
            other => panic!("expected lfu meta data, got {other:?}"),
        }
    }

    async fn store(
        strategy: &LfuReplacementStrategy,
        conf: &TierConfiguration,
        meta: &mut StackMetaData,
        id: &str,
    ) {
        strategy
            .store(conf, meta, id, Bytes::from_static(b"x"), &Attributes::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hits_accumulate() {
        let storage = eternal_storage();
        let conf = make_tier(storage.clone(), 10, 0.5);
        let strategy = LfuReplacementStrategy;
        let mut meta = strategy.create_meta_data();

        store(&strategy, &conf, &mut meta, "a").await;
        assert_eq!(lfu_inner(&meta).hits("t", "a"), Some(1));

        // Overwrite counts as a use.
        store(&strategy, &conf, &mut meta, "a").await;
        assert_eq!(lfu_inner(&meta).hits("t", "a"), Some(2));

        strategy
            .restore(&conf, &mut meta, "a", &Attributes::new(), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lfu_inner(&meta).hits("t", "a"), Some(3));
    }

    #[tokio::test]
    async fn test_eviction_prefers_least_used() {
        let storage = eternal_storage();
        let conf = make_tier(storage.clone(), 3, 0.5);
        let strategy = LfuReplacementStrategy;
        let mut meta = strategy.create_meta_data();

        store(&strategy, &conf, &mut meta, "a").await;
        store(&strategy, &conf, &mut meta, "b").await;
        store(&strategy, &conf, &mut meta, "c").await;

        // "c" becomes the clear favourite; "a" and "b" stay at one hit.
        for _ in 0..3 {
            strategy
                .restore(&conf, &mut meta, "c", &Attributes::new(), false)
                .await
                .unwrap()
                .unwrap();
        }

        // ceil(3 * 0.5) = 2 victims: the one-hit entries, oldest sequence
        // first.
        store(&strategy, &conf, &mut meta, "d").await;

        assert_eq!(storage.count().await.unwrap(), 2);
        let none = Attributes::new();
        assert!(storage.restore("a", &none, false).await.unwrap().is_none());
        assert!(storage.restore("b", &none, false).await.unwrap().is_none());
        assert!(storage.restore("c", &none, false).await.unwrap().is_some());
        assert!(storage.restore("d", &none, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_drops_counter_of_vanished_item() {
        let storage = eternal_storage();
        let conf = make_tier(storage.clone(), 2, 0.5);
        let strategy = LfuReplacementStrategy;
        let mut meta = strategy.create_meta_data();
        let none = Attributes::new();

        store(&strategy, &conf, &mut meta, "a").await;
        store(&strategy, &conf, &mut meta, "b").await;

        // "a" disappears behind the strategy's back; its counter stays.
        storage.delete("a", &none, false).await.unwrap();
        assert_eq!(lfu_inner(&meta).hits("t", "a"), Some(1));

        store(&strategy, &conf, &mut meta, "c").await;

        // The pass for "d" picks the stale "a" counter first: the storage
        // has nothing left to remove, but the counter still goes and no
        // live resident is lost.
        store(&strategy, &conf, &mut meta, "d").await;
        assert_eq!(lfu_inner(&meta).hits("t", "a"), None);
        assert_eq!(lfu_inner(&meta).tracked("t"), 3);
        assert!(storage.restore("b", &none, false).await.unwrap().is_some());

        // With the books straight again, the next pass takes a real victim.
        store(&strategy, &conf, &mut meta, "e").await;
        assert!(storage.restore("b", &none, false).await.unwrap().is_none());
        assert!(storage.restore("e", &none, false).await.unwrap().is_some());
        assert_eq!(lfu_inner(&meta).tracked("t"), 3);
    }

    #[test]
    fn test_ties_evict_older_sequence_first() {
        let mut meta = LfuMetaData::default();
        meta.record_use("t", "first");
        meta.record_use("t", "second");
        meta.record_use("t", "third");
        // "second" pulls ahead.
        meta.record_use("t", "second");

        assert_eq!(meta.victims("t", 2), vec![
            "first".to_string(),
            "third".to_string()
        ]);
    }

    #[tokio::test]
    async fn test_delete_drops_counters() {
        let storage = eternal_storage();
        let conf = make_tier(storage.clone(), 10, 0.5);
        let strategy = LfuReplacementStrategy;
        let mut meta = strategy.create_meta_data();

        store(&strategy, &conf, &mut meta, "a").await;
        store(&strategy, &conf, &mut meta, "b").await;

        strategy
            .delete(&conf, &mut meta, "b", &Attributes::new(), false)
            .await
            .unwrap();
        assert_eq!(lfu_inner(&meta).hits("t", "b"), None);
        assert_eq!(lfu_inner(&meta).tracked("t"), 1);
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected_before_any_io() {
        let storage = eternal_storage();
        let conf = make_tier(storage.clone(), 10, 0.5);
        let strategy = LfuReplacementStrategy;
        let mut meta = StackMetaData::Lru(LruMetaData::default());

        let outcome = strategy
            .store(&conf, &mut meta, "a", Bytes::from_static(b"x"), &Attributes::new())
            .await;
        assert_matches!(
            outcome,
            Err(Error::InvalidMetaDataKind { expected, actual })
                if expected == "lfu" && actual == "lru"
        );
        assert_eq!(storage.count().await.unwrap(), 0);
    }
}
