//! Property-Based Tests for Tier Capacity and Eviction Order
//!
//! Uses proptest to verify the replacement machinery across random
//! operation sequences.
//!
//! # Test Properties
//!
//! 1. **Capacity**: A tier never holds more than its item limit
//! 2. **Eviction Count**: One overflow evicts exactly ceil(limit * rate)
//! 3. **Recency Order**: LRU victims match a straightforward recency model
//! 4. **Search Resolution**: Search-mode restore resolves the smallest ID

#![cfg(test)]

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use crate::config::TierConfiguration;
use crate::stack::CacheStackBuilder;
use crate::storage::{Attributes, MemoryStorage, MemoryStorageOptions, StackableStorage};
use crate::strategy::{LruReplacementStrategy, ReplacementStrategy};
use crate::StackOptions;

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for free rates as (numerator, denominator) pairs whose products
/// with small limits are exact in binary floating point, keeping ceil()
/// deterministic.
fn free_rate_strategy() -> impl Strategy<Value = (u32, u32)> {
    prop_oneof![Just((1, 8)), Just((1, 4)), Just((1, 2)), Just((1, 1))]
}

fn expected_evicted(item_limit: usize, num: u32, den: u32) -> usize {
    (item_limit * num as usize + den as usize - 1) / den as usize
}

/// Zero-padded so lexicographic order matches numeric order.
fn id_of(index: usize) -> String {
    format!("id-{index:03}")
}

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

// =============================================================================
// Capacity Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: After any sequence of stores, the tier count never
    /// exceeds the item limit.
    #[test]
    fn prop_tier_count_never_exceeds_item_limit(
        item_limit in 1usize..=8,
        (num, den) in free_rate_strategy(),
        ops in prop::collection::vec(0usize..12, 1..40),
    ) {
        let rate = f64::from(num) / f64::from(den);
        let counts = tokio_test::block_on(async {
            let storage = eternal_storage();
            let conf = make_tier(storage.clone(), item_limit, rate);
            let strategy = LruReplacementStrategy;
            let mut meta = strategy.create_meta_data();

            let mut counts = Vec::with_capacity(ops.len());
            for index in &ops {
                strategy
                    .store(&conf, &mut meta, &id_of(*index), Bytes::from_static(b"x"), &Attributes::new())
                    .await
                    .unwrap();
                counts.push(storage.count().await.unwrap());
            }
            counts
        });

        for count in counts {
            prop_assert!(
                count <= item_limit,
                "count {} exceeded limit {}", count, item_limit
            );
        }
    }

    /// Property: Overflowing a full tier with live items evicts exactly
    /// ceil(item_limit * free_rate) of them, and the float computation
    /// agrees with integer arithmetic for these rates.
    #[test]
    fn prop_eviction_frees_exactly_the_computed_count(
        item_limit in 1usize..=16,
        (num, den) in free_rate_strategy(),
    ) {
        let rate = f64::from(num) / f64::from(den);
        let expected = expected_evicted(item_limit, num, den);

        let (evict_count, count_after) = tokio_test::block_on(async {
            let storage = eternal_storage();
            let conf = make_tier(storage.clone(), item_limit, rate);
            let strategy = LruReplacementStrategy;
            let mut meta = strategy.create_meta_data();

            for index in 0..item_limit {
                strategy
                    .store(&conf, &mut meta, &id_of(index), Bytes::from_static(b"x"), &Attributes::new())
                    .await
                    .unwrap();
            }
            strategy
                .store(&conf, &mut meta, "overflow", Bytes::from_static(b"x"), &Attributes::new())
                .await
                .unwrap();

            (conf.evict_count(), storage.count().await.unwrap())
        });

        prop_assert!(expected >= 1 && expected <= item_limit);
        prop_assert_eq!(evict_count, expected);
        prop_assert_eq!(count_after, item_limit - expected + 1);
    }
}

// =============================================================================
// Ordering Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: The items an overflow evicts are exactly the ones a plain
    /// recency list predicts, regardless of the touch sequence.
    #[test]
    fn prop_lru_victims_match_recency_model(
        item_limit in 2usize..=6,
        (num, den) in free_rate_strategy(),
        touches in prop::collection::vec(0usize..6, 0..12),
    ) {
        let rate = f64::from(num) / f64::from(den);
        let evicted = expected_evicted(item_limit, num, den);

        // Recency model: stores in index order, each touch moves the item
        // to the most-recent end.
        let mut order: Vec<usize> = (0..item_limit).collect();
        for &touch in &touches {
            if touch >= item_limit {
                continue;
            }
            order.retain(|&index| index != touch);
            order.push(touch);
        }
        let expected_gone: Vec<usize> = order[..evicted].to_vec();
        let expected_kept: Vec<usize> = order[evicted..].to_vec();

        let (gone_hits, kept_hits, overflow_hit) = tokio_test::block_on(async {
            let storage = eternal_storage();
            let conf = make_tier(storage.clone(), item_limit, rate);
            let strategy = LruReplacementStrategy;
            let mut meta = strategy.create_meta_data();
            let none = Attributes::new();

            for index in 0..item_limit {
                strategy
                    .store(&conf, &mut meta, &id_of(index), Bytes::from_static(b"x"), &none)
                    .await
                    .unwrap();
            }
            for &touch in &touches {
                if touch >= item_limit {
                    continue;
                }
                strategy
                    .restore(&conf, &mut meta, &id_of(touch), &none, false)
                    .await
                    .unwrap();
            }
            strategy
                .store(&conf, &mut meta, "overflow", Bytes::from_static(b"x"), &none)
                .await
                .unwrap();

            let mut gone_hits = Vec::new();
            for &index in &expected_gone {
                gone_hits.push(storage.restore(&id_of(index), &none, false).await.unwrap().is_some());
            }
            let mut kept_hits = Vec::new();
            for &index in &expected_kept {
                kept_hits.push(storage.restore(&id_of(index), &none, false).await.unwrap().is_some());
            }
            let overflow_hit = storage.restore("overflow", &none, false).await.unwrap().is_some();
            (gone_hits, kept_hits, overflow_hit)
        });

        prop_assert!(
            gone_hits.iter().all(|hit| !hit),
            "a predicted victim survived; model order {:?}", order
        );
        prop_assert!(
            kept_hits.iter().all(|hit| *hit),
            "a predicted survivor was evicted; model order {:?}", order
        );
        prop_assert!(overflow_hit);
    }

    /// Property: A search-mode restore through a full stack resolves the
    /// lexicographically smallest matching ID.
    #[test]
    fn prop_search_restore_resolves_smallest_matching_id(
        indexes in prop::collection::btree_set(0usize..50, 1..10),
    ) {
        let smallest = id_of(*indexes.iter().next().unwrap());

        let resolved = tokio_test::block_on(async {
            let storage = eternal_storage();
            let tier = make_tier(storage, 100, 0.5);
            let mut builder = CacheStackBuilder::new(StackOptions::default());
            builder.push_tier(tier).unwrap();
            let stack = builder.build().await.unwrap();

            let attributes: Attributes =
                [("kind".to_string(), "page".to_string())].into_iter().collect();
            for &index in &indexes {
                stack
                    .store(&id_of(index), Bytes::from_static(b"x"), &attributes)
                    .await
                    .unwrap();
            }
            stack
                .restore("", &attributes, true)
                .await
                .unwrap()
                .map(|found| found.id)
        });

        prop_assert_eq!(resolved, Some(smallest));
    }
}
