//! The in-memory store implementation.
use std::collections::HashMap;
use std::sync::RwLock;

use super::{AllData, DataKind, DataStore, Item, ItemDescriptor};

/// A thread-safe in-memory [`DataStore`].
///
/// A single lock guards all kinds, so `upsert` and `delete` behave as
/// atomic read-compare-write: a writer that raced and lost its version
/// check leaves no visible effect.
#[derive(Default)]
pub struct InMemoryDataStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    data: AllData,
    initialized: bool,
}

impl InMemoryDataStore {
    pub fn new() -> InMemoryDataStore {
        InMemoryDataStore::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: AllData) {
        // self.inner.write() should always return Ok(). Err() is possible
        // only if the lock is poisoned (writer panicked while holding the
        // lock), which should never happen.
        let mut inner = self
            .inner
            .write()
            .expect("thread holding store lock should not panic");
        inner.data = data;
        inner.initialized = true;
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<Item> {
        let inner = self
            .inner
            .read()
            .expect("thread holding store lock should not panic");
        inner
            .data
            .get(&kind)
            .and_then(|items| items.get(key))
            .and_then(|descriptor| descriptor.item.clone())
    }

    fn all(&self, kind: DataKind) -> HashMap<String, Item> {
        let inner = self
            .inner
            .read()
            .expect("thread holding store lock should not panic");
        inner
            .data
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|(key, descriptor)| {
                        descriptor.item.clone().map(|item| (key.clone(), item))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn upsert(&self, kind: DataKind, item: ItemDescriptor) -> bool {
        let mut inner = self
            .inner
            .write()
            .expect("thread holding store lock should not panic");
        let items = inner.data.entry(kind).or_default();
        let key = match &item.item {
            Some(i) => i.key().to_owned(),
            // An upsert of a bare tombstone is expressed via delete().
            None => return false,
        };
        match items.get(&key) {
            Some(existing) if existing.version >= item.version => false,
            _ => {
                items.insert(key, item);
                true
            }
        }
    }

    fn delete(&self, kind: DataKind, key: &str, version: u64) -> bool {
        let mut inner = self
            .inner
            .write()
            .expect("thread holding store lock should not panic");
        let items = inner.data.entry(kind).or_default();
        match items.get(key) {
            Some(existing) if existing.version >= version => false,
            _ => {
                items.insert(key.to_owned(), ItemDescriptor::tombstone(version));
                true
            }
        }
    }

    fn initialized(&self) -> bool {
        self.inner
            .read()
            .expect("thread holding store lock should not panic")
            .initialized
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::DataKind::Features;

    fn flag(key: &str, version: u64) -> ItemDescriptor {
        Features
            .parse_item(json!({"key": key, "version": version, "on": true, "variations": []}))
            .unwrap()
    }

    #[test]
    fn starts_uninitialized_and_empty() {
        let store = InMemoryDataStore::new();
        assert!(!store.initialized());
        assert_eq!(store.get(Features, "f"), None);
        assert!(store.all(Features).is_empty());
    }

    #[test]
    fn init_replaces_all_contents() {
        let store = InMemoryDataStore::new();
        store.upsert(Features, flag("old", 1));

        let mut items = std::collections::HashMap::new();
        items.insert("new".to_owned(), flag("new", 1));
        store.init([(Features, items)].into());

        assert!(store.initialized());
        assert_eq!(store.get(Features, "old"), None);
        assert!(store.get(Features, "new").is_some());
    }

    #[test]
    fn upsert_never_lowers_a_version() {
        let store = InMemoryDataStore::new();
        assert!(store.upsert(Features, flag("f", 5)));
        assert!(!store.upsert(Features, flag("f", 4)));
        assert!(!store.upsert(Features, flag("f", 5)));
        assert_eq!(store.get(Features, "f").unwrap().version(), 5);

        assert!(store.upsert(Features, flag("f", 6)));
        assert_eq!(store.get(Features, "f").unwrap().version(), 6);
    }

    #[test]
    fn delete_leaves_an_invisible_tombstone() {
        let store = InMemoryDataStore::new();
        store.upsert(Features, flag("f", 5));
        assert!(store.delete(Features, "f", 6));

        assert_eq!(store.get(Features, "f"), None);
        assert!(store.all(Features).is_empty());
    }

    #[test]
    fn tombstone_still_wins_version_comparisons() {
        let store = InMemoryDataStore::new();
        store.delete(Features, "f", 10);

        // An older (or equal-version) item cannot resurrect the key.
        assert!(!store.upsert(Features, flag("f", 9)));
        assert!(!store.upsert(Features, flag("f", 10)));
        assert_eq!(store.get(Features, "f"), None);

        // A genuinely newer one can.
        assert!(store.upsert(Features, flag("f", 11)));
        assert!(store.get(Features, "f").is_some());
    }

    #[test]
    fn delete_with_equal_version_is_a_no_op() {
        let store = InMemoryDataStore::new();
        store.upsert(Features, flag("f", 5));
        assert!(!store.delete(Features, "f", 5));
        assert!(store.get(Features, "f").is_some());
    }

    #[test]
    fn delete_of_missing_key_records_the_tombstone() {
        let store = InMemoryDataStore::new();
        assert!(store.delete(Features, "ghost", 3));
        assert_eq!(store.get(Features, "ghost"), None);
        assert!(!store.upsert(Features, flag("ghost", 2)));
    }

    #[test]
    fn version_is_max_of_observed_versions() {
        let store = InMemoryDataStore::new();
        for version in [3, 1, 7, 5, 7, 2] {
            store.upsert(Features, flag("f", version));
        }
        assert_eq!(store.get(Features, "f").unwrap().version(), 7);
    }

    #[test]
    fn can_write_from_another_thread() {
        let store = Arc::new(InMemoryDataStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.init(AllData::new());
                store.upsert(Features, flag("f", 1));
            })
            .join();
        }

        assert!(store.initialized());
        assert!(store.get(Features, "f").is_some());
    }
}
