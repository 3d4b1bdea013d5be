//! Concurrent map engine behind the shipped backends
//!
//! [`MemoryStorage`](super::MemoryStorage) owns one of these;
//! [`SharedMemoryStorage`](super::SharedMemoryStorage) clones share one
//! behind an `Arc`. Items and control records live in separate maps, which
//! is what keeps reserved keys out of counts, purges and searches.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{Attributes, Restored};

/// One stored item plus the insertion time its lifetime is measured from
#[derive(Debug, Clone)]
struct StoredItem {
    data: Bytes,
    attributes: Attributes,
    stored_at: DateTime<Utc>,
}

impl StoredItem {
    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            Some(ttl) => now
                .signed_duration_since(self.stored_at)
                .to_std()
                .map(|age| age >= ttl)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Search-mode filter: empty ID is a wildcard, a non-empty ID must
    /// match exactly, and every filter attribute must be present and equal.
    fn matches(&self, id: &str, filter_id: &str, filter: &Attributes) -> bool {
        if !filter_id.is_empty() && id != filter_id {
            return false;
        }
        filter
            .iter()
            .all(|(key, value)| self.attributes.get(key) == Some(value))
    }
}

/// Item space plus control space over two concurrent maps
#[derive(Debug, Default)]
pub(super) struct ItemStore {
    items: DashMap<String, StoredItem>,
    control: DashMap<String, Bytes>,
}

impl ItemStore {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn store(&self, id: &str, data: Bytes, attributes: &Attributes) {
        self.items.insert(
            id.to_string(),
            StoredItem {
                data,
                attributes: attributes.clone(),
                stored_at: Utc::now(),
            },
        );
    }

    pub(super) fn restore(
        &self,
        ttl: Option<Duration>,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Option<Restored> {
        let now = Utc::now();
        if !search {
            return self
                .items
                .get(id)
                .filter(|item| !item.is_expired(ttl, now))
                .map(|item| Restored {
                    id: id.to_string(),
                    data: item.data.clone(),
                });
        }

        let mut best: Option<Restored> = None;
        for entry in self.items.iter() {
            if entry.is_expired(ttl, now) || !entry.matches(entry.key(), id, attributes) {
                continue;
            }
            let smaller = best
                .as_ref()
                .map_or(true, |found| entry.key() < &found.id);
            if smaller {
                best = Some(Restored {
                    id: entry.key().clone(),
                    data: entry.data.clone(),
                });
            }
        }
        best
    }

    pub(super) fn delete(
        &self,
        ttl: Option<Duration>,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Vec<String> {
        if !search {
            return match self.items.remove(id) {
                Some(_) => vec![id.to_string()],
                None => Vec::new(),
            };
        }

        let now = Utc::now();
        // Collect first: removing while iterating the same shard deadlocks.
        let matched: Vec<String> = self
            .items
            .iter()
            .filter(|entry| {
                !entry.is_expired(ttl, now) && entry.matches(entry.key(), id, attributes)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(matched.len());
        for key in matched {
            if self.items.remove(&key).is_some() {
                removed.push(key);
            }
        }
        removed.sort();
        removed
    }

    pub(super) fn purge(&self, ttl: Option<Duration>) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|entry| entry.is_expired(ttl, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if self.items.remove(&key).is_some() {
                removed.push(key);
            }
        }
        removed.sort();
        if !removed.is_empty() {
            debug!(removed = removed.len(), "purged expired items");
        }
        removed
    }

    pub(super) fn count(&self) -> usize {
        self.items.len()
    }

    pub(super) fn clear_items(&self) {
        self.items.clear();
    }

    // -------------------------------------------------------------------------
    // Control space: meta data blob and lock sentinel
    // -------------------------------------------------------------------------

    pub(super) fn put_control(&self, key: &str, blob: Bytes) {
        self.control.insert(key.to_string(), blob);
    }

    /// Test-and-set insert. Returns true when this caller created the record.
    pub(super) fn try_put_control(&self, key: &str, blob: Bytes) -> bool {
        match self.control.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(blob);
                true
            }
        }
    }

    pub(super) fn get_control(&self, key: &str) -> Option<Bytes> {
        self.control.get(key).map(|blob| blob.clone())
    }

    pub(super) fn remove_control(&self, key: &str) {
        self.control.remove(key);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn seed(store: &ItemStore) {
        store.store("doc-a", Bytes::from_static(b"a"), &attrs(&[("lang", "en")]));
        store.store(
            "doc-b",
            Bytes::from_static(b"b"),
            &attrs(&[("lang", "en"), ("section", "news")]),
        );
        store.store("doc-c", Bytes::from_static(b"c"), &attrs(&[("lang", "de")]));
    }

    #[test]
    fn test_exact_restore_ignores_attributes() {
        let store = ItemStore::new();
        seed(&store);

        let found = store
            .restore(None, "doc-a", &attrs(&[("lang", "no-such")]), false)
            .unwrap();
        assert_eq!(found.id, "doc-a");
        assert_eq!(found.data, Bytes::from_static(b"a"));
    }

    #[test]
    fn test_search_wildcard_id_picks_smallest_match() {
        let store = ItemStore::new();
        seed(&store);

        let found = store.restore(None, "", &attrs(&[("lang", "en")]), true).unwrap();
        assert_eq!(found.id, "doc-a");

        let found = store
            .restore(None, "", &attrs(&[("lang", "en"), ("section", "news")]), true)
            .unwrap();
        assert_eq!(found.id, "doc-b");
    }

    #[test]
    fn test_search_with_id_requires_exact_id() {
        let store = ItemStore::new();
        seed(&store);

        assert!(store
            .restore(None, "doc-c", &attrs(&[("lang", "de")]), true)
            .is_some());
        assert!(store
            .restore(None, "doc-c", &attrs(&[("lang", "en")]), true)
            .is_none());
    }

    #[test]
    fn test_search_delete_removes_all_matches() {
        let store = ItemStore::new();
        seed(&store);

        let removed = store.delete(None, "", &attrs(&[("lang", "en")]), true);
        assert_eq!(removed, vec!["doc-a".to_string(), "doc-b".to_string()]);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_exact_delete_reports_only_removed() {
        let store = ItemStore::new();
        seed(&store);

        assert_eq!(store.delete(None, "doc-a", &Attributes::new(), false), vec![
            "doc-a".to_string()
        ]);
        assert!(store.delete(None, "doc-a", &Attributes::new(), false).is_empty());
    }

    #[test]
    fn test_expired_items_counted_until_purged() {
        let store = ItemStore::new();
        seed(&store);

        let ttl = Some(Duration::ZERO);
        assert!(store.restore(ttl, "doc-a", &Attributes::new(), false).is_none());
        assert_eq!(store.count(), 3);

        let purged = store.purge(ttl);
        assert_eq!(purged, vec![
            "doc-a".to_string(),
            "doc-b".to_string(),
            "doc-c".to_string()
        ]);
        assert_eq!(store.count(), 0);
        assert!(store.purge(ttl).is_empty());
    }

    #[test]
    fn test_search_skips_expired() {
        let store = ItemStore::new();
        seed(&store);

        assert!(store.restore(Some(Duration::ZERO), "", &attrs(&[("lang", "en")]), true).is_none());
        assert!(store.delete(Some(Duration::ZERO), "", &attrs(&[("lang", "en")]), true).is_empty());
    }

    #[test]
    fn test_eternal_ttl_never_expires() {
        let store = ItemStore::new();
        seed(&store);

        assert!(store.purge(None).is_empty());
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn test_control_space_is_invisible_to_items() {
        let store = ItemStore::new();
        store.put_control(".metaData", Bytes::from_static(b"{}"));
        assert!(store.try_put_control(".lock", Bytes::from_static(b"{}")));
        assert!(!store.try_put_control(".lock", Bytes::from_static(b"{}")));

        assert_eq!(store.count(), 0);
        assert!(store.purge(Some(Duration::ZERO)).is_empty());
        assert!(store.restore(None, "", &Attributes::new(), true).is_none());

        // An item may even share a reserved key without touching it.
        store.store(".metaData", Bytes::from_static(b"payload"), &Attributes::new());
        assert_eq!(store.count(), 1);
        assert_eq!(store.get_control(".metaData"), Some(Bytes::from_static(b"{}")));

        store.clear_items();
        assert_eq!(store.count(), 0);
        assert_eq!(store.get_control(".metaData"), Some(Bytes::from_static(b"{}")));

        store.remove_control(".lock");
        assert!(store.try_put_control(".lock", Bytes::from_static(b"{}")));
    }
}
