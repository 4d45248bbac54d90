use std::{collections::BTreeMap, num::NonZeroUsize};

use lru::LruCache;
use parking_lot::Mutex;

use crate::rule::CollectionRef;

const KEY_SEPARATOR: &str = "\u{1F}";

type GroupedWeights = BTreeMap<Option<String>, Vec<(String, i64)>>;

/// LRU cache of weighted-tag query results, keyed per collection with one
/// entry per group filter. Writers invalidate whole collections, so a hit
/// always reflects the store.
pub struct QueryCache {
    inner: Mutex<LruCache<String, GroupedWeights>>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|size| Self {
            inner: Mutex::new(LruCache::new(size)),
        })
    }

    pub fn get(&self, collection: &CollectionRef, group: Option<&str>) -> Option<Vec<(String, i64)>> {
        let key = make_key(collection);
        let mut guard = self.inner.lock();
        guard
            .get(&key)
            .and_then(|groups| groups.get(&group.map(str::to_string)).cloned())
    }

    pub fn put(
        &self,
        collection: &CollectionRef,
        group: Option<&str>,
        weights: Vec<(String, i64)>,
    ) {
        let key = make_key(collection);
        let group = group.map(str::to_string);
        let mut guard = self.inner.lock();
        if let Some(groups) = guard.get_mut(&key) {
            groups.insert(group, weights);
        } else {
            let mut groups = GroupedWeights::new();
            groups.insert(group, weights);
            guard.put(key, groups);
        }
    }

    pub fn invalidate(&self, collection: &CollectionRef) {
        let mut guard = self.inner.lock();
        guard.pop(&make_key(collection));
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.clear();
    }
}

fn make_key(collection: &CollectionRef) -> String {
    format!(
        "{}{KEY_SEPARATOR}{}",
        collection.database, collection.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(name: &str) -> CollectionRef {
        CollectionRef {
            database: "default".into(),
            name: name.into(),
        }
    }

    #[test]
    fn caches_per_group_and_invalidates_per_collection() {
        let cache = QueryCache::new(4).unwrap();
        let coll = collection("articles_tags_aggregation");

        assert!(cache.get(&coll, None).is_none());
        cache.put(&coll, None, vec![("food".into(), 3)]);
        cache.put(&coll, Some("user1"), vec![("ant".into(), 1)]);

        assert_eq!(cache.get(&coll, None).unwrap(), vec![("food".into(), 3)]);
        assert_eq!(
            cache.get(&coll, Some("user1")).unwrap(),
            vec![("ant".into(), 1)]
        );
        assert!(cache.get(&coll, Some("user2")).is_none());

        cache.invalidate(&coll);
        assert!(cache.get(&coll, None).is_none());
        assert!(cache.get(&coll, Some("user1")).is_none());
    }

    #[test]
    fn zero_capacity_disables_the_cache() {
        assert!(QueryCache::new(0).is_none());
    }
}
