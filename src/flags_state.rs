//! Bulk evaluation snapshots, e.g. for bootstrapping front-end clients.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detail::Reason;

/// Options for [`crate::Client::all_flags_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagsStateOptions {
    /// Only include flags marked visible to client-side SDKs.
    pub client_side_only: bool,
    /// Include evaluation reasons in the per-flag metadata.
    pub with_reasons: bool,
    /// Omit reasons and versions for flags that don't track events, to
    /// keep the payload small.
    pub details_only_for_tracked_flags: bool,
}

/// Per-flag metadata carried alongside the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
}

/// The state of all flags for one user: a value map plus a metadata map,
/// in the JSON shape client-side SDK bootstrapping expects.
///
/// ```json
/// {
///   "flag-key": "value",
///   "$flagsState": {"flag-key": {"version": 10, "variation": 1}},
///   "$valid": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagsState {
    #[serde(flatten)]
    values: HashMap<String, Value>,
    #[serde(rename = "$flagsState")]
    metadata: HashMap<String, FlagMetadata>,
    #[serde(rename = "$valid")]
    valid: bool,
}

impl FlagsState {
    pub(crate) fn new(valid: bool) -> FlagsState {
        FlagsState {
            values: HashMap::new(),
            metadata: HashMap::new(),
            valid,
        }
    }

    pub(crate) fn add_flag(&mut self, key: &str, value: Option<Value>, metadata: FlagMetadata) {
        self.values
            .insert(key.to_owned(), value.unwrap_or(Value::Null));
        self.metadata.insert(key.to_owned(), metadata);
    }

    /// Whether the snapshot was produced from an initialized client.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The evaluated value of one flag.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The metadata of one flag.
    pub fn metadata(&self, key: &str) -> Option<&FlagMetadata> {
        self.metadata.get(key)
    }

    /// Keys present in the snapshot.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }
}
