//! The versioned local cache of flag and segment definitions.
//!
//! The store is keyed by `(kind, key)`. Every stored value carries a
//! version; updates only ever move versions forward, and deletions leave a
//! versioned tombstone behind so a late out-of-order update cannot
//! resurrect a deleted item.
use std::collections::HashMap;

use serde_json::Value;

use crate::models::{FeatureFlag, Segment};
use crate::{Error, Result};

mod memory;
mod notifying;

pub use memory::InMemoryDataStore;
pub use notifying::NotifyingDataStore;

/// The kinds of data the store holds.
///
/// Each kind owns a namespace in the store and a path prefix used to route
/// streamed patch/delete events to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    /// All kinds, in a stable order.
    pub const ALL: [DataKind; 2] = [DataKind::Features, DataKind::Segments];

    pub fn namespace(self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// The path prefix identifying this kind in stream events and REST
    /// endpoints, e.g. `/flags/my-flag-key`.
    pub fn stream_api_path(self) -> &'static str {
        match self {
            DataKind::Features => "/flags/",
            DataKind::Segments => "/segments/",
        }
    }

    /// Route an event path to a kind and item key.
    pub fn for_path(path: &str) -> Option<(DataKind, &str)> {
        DataKind::ALL.iter().find_map(|kind| {
            path.strip_prefix(kind.stream_api_path())
                .map(|key| (*kind, key))
        })
    }

    /// Parse an item of this kind from its JSON form.
    ///
    /// A body carrying `"deleted": true` parses into a tombstone.
    pub fn parse_item(self, data: Value) -> Result<ItemDescriptor> {
        if let Some(version) = tombstone_version(&data) {
            return Ok(ItemDescriptor {
                version,
                item: None,
            });
        }
        let item = match self {
            DataKind::Features => Item::Flag(serde_json::from_value::<FeatureFlag>(data)?),
            DataKind::Segments => Item::Segment(serde_json::from_value::<Segment>(data)?),
        };
        Ok(ItemDescriptor {
            version: item.version(),
            item: Some(item),
        })
    }
}

fn tombstone_version(data: &Value) -> Option<u64> {
    if data.get("deleted").and_then(Value::as_bool) == Some(true) {
        data.get("version").and_then(Value::as_u64)
    } else {
        None
    }
}

/// A stored value: a flag or a segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Flag(FeatureFlag),
    Segment(Segment),
}

impl Item {
    pub fn key(&self) -> &str {
        match self {
            Item::Flag(flag) => &flag.key,
            Item::Segment(segment) => &segment.key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Item::Flag(flag) => flag.version,
            Item::Segment(segment) => segment.version,
        }
    }
}

/// An item slot together with its version. `item: None` is a tombstone:
/// invisible to reads but still participating in version comparisons.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Item>,
}

impl ItemDescriptor {
    pub fn new(item: Item) -> ItemDescriptor {
        ItemDescriptor {
            version: item.version(),
            item: Some(item),
        }
    }

    pub fn tombstone(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }
}

/// A full data snapshot, as delivered by a `put` event or a poll.
pub type AllData = HashMap<DataKind, HashMap<String, ItemDescriptor>>;

/// The store interface.
///
/// The in-memory implementation is [`InMemoryDataStore`]; a persistent
/// backend can be plugged in by implementing this trait. Reads return owned
/// copies, so callers can never alias the store's internal item graph.
pub trait DataStore: Send + Sync {
    /// Atomically replace all contents with the given snapshot and mark the
    /// store initialized.
    fn init(&self, data: AllData);

    /// Get one item. Missing and tombstoned items are both `None`.
    fn get(&self, kind: DataKind, key: &str) -> Option<Item>;

    /// All live items of a kind. Tombstones are omitted.
    fn all(&self, kind: DataKind) -> HashMap<String, Item>;

    /// Insert or update an item if its version is newer than the stored
    /// one. Returns whether the update was applied.
    fn upsert(&self, kind: DataKind, item: ItemDescriptor) -> bool;

    /// Replace an item with a tombstone if `version` is newer than the
    /// stored one. Returns whether the delete was applied.
    fn delete(&self, kind: DataKind, key: &str, version: u64) -> bool;

    /// Whether `init` has been called at least once.
    fn initialized(&self) -> bool;

    /// Release any held resources.
    fn close(&self) {}
}

/// Typed read of a flag.
pub(crate) fn get_flag(store: &dyn DataStore, key: &str) -> Option<FeatureFlag> {
    match store.get(DataKind::Features, key) {
        Some(Item::Flag(flag)) => Some(flag),
        _ => None,
    }
}

/// Typed read of a segment.
pub(crate) fn get_segment(store: &dyn DataStore, key: &str) -> Option<Segment> {
    match store.get(DataKind::Segments, key) {
        Some(Item::Segment(segment)) => Some(segment),
        _ => None,
    }
}

/// Parse a full `{"flags": {...}, "segments": {...}}` payload into a
/// snapshot, as served by the all-data endpoint and `put` events.
pub(crate) fn parse_all_data(data: Value) -> Result<AllData> {
    let mut object = match data {
        Value::Object(object) => object,
        other => {
            return Err(Error::InvalidEventData(std::sync::Arc::new(
                serde::de::Error::custom(format!("expected object, got {other}")),
            )))
        }
    };

    let mut all_data = AllData::new();
    for (kind, field) in [(DataKind::Features, "flags"), (DataKind::Segments, "segments")] {
        let mut items = HashMap::new();
        if let Some(Value::Object(entries)) = object.remove(field) {
            for (key, value) in entries {
                items.insert(key, kind.parse_item(value)?);
            }
        }
        all_data.insert(kind, items);
    }
    Ok(all_data)
}
