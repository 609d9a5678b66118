//! A store decorator that broadcasts change notifications.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{AllData, DataKind, DataStore, Item, ItemDescriptor};

type UpdateListener = Box<dyn Fn(&str) + Send + Sync>;
type KeyListener = Box<dyn Fn() + Send + Sync>;

/// Forwards all operations to an inner store and, after any change that
/// actually commits, notifies subscribers. No-op downgrades (an upsert or
/// delete that lost its version check) produce no notification.
pub struct NotifyingDataStore {
    inner: Arc<dyn DataStore>,
    listeners: RwLock<Listeners>,
}

#[derive(Default)]
struct Listeners {
    all: Vec<UpdateListener>,
    by_key: HashMap<String, Vec<KeyListener>>,
}

impl NotifyingDataStore {
    pub fn new(inner: Arc<dyn DataStore>) -> NotifyingDataStore {
        NotifyingDataStore {
            inner,
            listeners: RwLock::new(Listeners::default()),
        }
    }

    /// Subscribe to all item changes. The listener receives the changed key.
    pub fn on_update(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("thread holding listener lock should not panic")
            .all
            .push(Box::new(listener));
    }

    /// Subscribe to changes of one specific key.
    pub fn on_update_for_key(&self, key: impl Into<String>, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("thread holding listener lock should not panic")
            .by_key
            .entry(key.into())
            .or_default()
            .push(Box::new(listener));
    }

    fn notify(&self, key: &str) {
        let listeners = self
            .listeners
            .read()
            .expect("thread holding listener lock should not panic");
        for listener in &listeners.all {
            listener(key);
        }
        if let Some(key_listeners) = listeners.by_key.get(key) {
            for listener in key_listeners {
                listener();
            }
        }
    }

    /// Keys whose live item differs between two snapshots of one kind.
    fn changed_keys(old: &HashMap<String, Item>, new: &HashMap<String, Item>) -> Vec<String> {
        let mut keys: Vec<String> = old
            .iter()
            .filter(|(key, item)| new.get(*key).map_or(true, |n| n.version() != item.version()))
            .map(|(key, _)| key.clone())
            .collect();
        keys.extend(
            new.keys()
                .filter(|key| !old.contains_key(*key))
                .cloned(),
        );
        keys
    }
}

impl DataStore for NotifyingDataStore {
    fn init(&self, data: AllData) {
        let old: Vec<(DataKind, HashMap<String, Item>)> = DataKind::ALL
            .iter()
            .map(|kind| (*kind, self.inner.all(*kind)))
            .collect();

        self.inner.init(data);

        for (kind, old_items) in old {
            let new_items = self.inner.all(kind);
            for key in NotifyingDataStore::changed_keys(&old_items, &new_items) {
                self.notify(&key);
            }
        }
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<Item> {
        self.inner.get(kind, key)
    }

    fn all(&self, kind: DataKind) -> HashMap<String, Item> {
        self.inner.all(kind)
    }

    fn upsert(&self, kind: DataKind, item: ItemDescriptor) -> bool {
        let key = item.item.as_ref().map(|i| i.key().to_owned());
        let applied = self.inner.upsert(kind, item);
        if applied {
            if let Some(key) = key {
                self.notify(&key);
            }
        }
        applied
    }

    fn delete(&self, kind: DataKind, key: &str, version: u64) -> bool {
        let applied = self.inner.delete(kind, key, version);
        if applied {
            self.notify(key);
        }
        applied
    }

    fn initialized(&self) -> bool {
        self.inner.initialized()
    }

    fn close(&self) {
        self.inner.close();
    }
}
