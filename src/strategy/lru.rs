//! Least-recently-used replacement
//!
//! Every store and every restore hit refreshes an item's recency marker.
//! When a full tier needs room, the items with the oldest markers go first.
//! Markers carry both a wall-clock touch time and a monotonic sequence
//! number; the sequence breaks timestamp ties and keeps the order stable
//! across clock skew and restarts, since it is persisted with the blob.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TierConfiguration;
use crate::error::{Error, Result};
use crate::meta_data::StackMetaData;
use crate::storage::{Attributes, Restored};
use crate::strategy::{ReplacementStrategy, StrategyKind};

/// One item's recency marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LruEntry {
    /// Wall-clock time of the last touch
    touched_at: DateTime<Utc>,
    /// Monotonic tie-break, claimed at the last touch
    sequence: u64,
}

/// Recency bookkeeping, sectioned per tier and keyed by tier name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LruMetaData {
    /// Next value of the shared sequence counter
    next_sequence: u64,
    /// Per-tier marker maps
    tiers: BTreeMap<String, BTreeMap<String, LruEntry>>,
}

impl LruMetaData {
    /// Record a touch for `id` in `tier`, claiming the next sequence value.
    pub(crate) fn touch(&mut self, tier: &str, id: &str) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tiers.entry(tier.to_string()).or_default().insert(
            id.to_string(),
            LruEntry {
                touched_at: Utc::now(),
                sequence,
            },
        );
    }

    /// Drop the markers for `ids` in `tier`.
    pub(crate) fn remove(&mut self, tier: &str, ids: &[String]) {
        if let Some(entries) = self.tiers.get_mut(tier) {
            for id in ids {
                entries.remove(id);
            }
        }
    }

    /// Least-recently-touched IDs in `tier`, oldest first, at most `count`.
    pub(crate) fn victims(&self, tier: &str, count: usize) -> Vec<String> {
        let entries = match self.tiers.get(tier) {
            Some(entries) => entries,
            None => return Vec::new(),
        };
        let mut ordered: Vec<(&String, &LruEntry)> = entries.iter().collect();
        ordered.sort_by_key(|(_, entry)| (entry.touched_at, entry.sequence));
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

    /// Whether `id` carries a marker in `tier`.
    pub fn contains(&self, tier: &str, id: &str) -> bool {
        self.tiers
            .get(tier)
            .map_or(false, |entries| entries.contains_key(id))
    }
}

/// The least-recently-used strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct LruReplacementStrategy;

impl LruReplacementStrategy {
    /// Unwrap the blob, rejecting one written by a different strategy. Runs
    /// before any storage access so a mismatch never mutates the tier.
    fn meta_mut<'a>(&self, meta: &'a mut StackMetaData) -> Result<&'a mut LruMetaData> {
        match meta {
            StackMetaData::Lru(inner) => Ok(inner),
            other => Err(Error::InvalidMetaDataKind {
                expected: StrategyKind::Lru.to_string(),
                actual: other.kind().to_string(),
            }),
        }
    }
}

#[async_trait]
impl ReplacementStrategy for LruReplacementStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lru
    }

    fn create_meta_data(&self) -> StackMetaData {
        StackMetaData::Lru(LruMetaData::default())
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
                    "evicting least recently used items"
                );
                let none = Attributes::new();
                for victim in &victims {
                    // A victim already gone from storage still loses its marker.
                    conf.storage().delete(victim, &none, false).await?;
                }
                meta.remove(conf.name(), &victims);
            }
        }

        conf.storage().store(id, data, attributes).await?;
        meta.touch(conf.name(), id);
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
            meta.touch(conf.name(), &hit.id);
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
