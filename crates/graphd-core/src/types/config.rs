//! Run configuration carried by assistants, threads, and runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::metadata::JsonMap;

/// Structured configuration passed to a graph invocation.
///
/// The `configurable` sub-mapping is the layer that gets deep-merged when
/// assistant, thread, and user configs are combined; everything else merges
/// shallowly with later layers overriding earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursion_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub configurable: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl RunConfig {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.recursion_limit.is_none()
            && self.configurable.is_empty()
            && self.extra.is_empty()
    }

    /// Merge `overlay` on top of `self`, overlay winning on conflicts.
    ///
    /// `configurable` merges key-wise recursively; tags concatenate without
    /// duplicates; `extra` merges shallowly.
    pub fn merged_with(&self, overlay: &RunConfig) -> RunConfig {
        let mut tags = self.tags.clone();
        for tag in &overlay.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        let mut configurable = self.configurable.clone();
        deep_merge_map(&mut configurable, &overlay.configurable);

        let mut extra = self.extra.clone();
        for (key, value) in &overlay.extra {
            extra.insert(key.clone(), value.clone());
        }

        RunConfig {
            tags,
            recursion_limit: overlay.recursion_limit.or(self.recursion_limit),
            configurable,
            extra,
        }
    }
}

fn deep_merge_map(base: &mut JsonMap, overlay: &JsonMap) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge_map(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
