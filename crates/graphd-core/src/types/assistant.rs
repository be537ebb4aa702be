//! Assistant type definitions
//!
//! An assistant is a named, versioned binding of a graph to a default
//! configuration. Every mutation of a live assistant records an immutable
//! version snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::RunConfig;
use super::metadata::JsonMap;

/// A live assistant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub assistant_id: Uuid,
    /// Names an installed graph in the registry.
    pub graph_id: String,
    /// Current version, always backed by a matching [`AssistantVersion`].
    pub version: u32,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub metadata: JsonMap,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assistant {
    /// Create a fresh assistant at version 1. `name` defaults to the graph id.
    pub fn new(
        assistant_id: Uuid,
        graph_id: impl Into<String>,
        config: RunConfig,
        metadata: JsonMap,
        name: Option<String>,
    ) -> Self {
        let graph_id = graph_id.into();
        let now = Utc::now();
        Self {
            assistant_id,
            name: name.unwrap_or_else(|| graph_id.clone()),
            graph_id,
            version: 1,
            config,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Snapshot the current state as an immutable version record.
    pub fn as_version(&self) -> AssistantVersion {
        AssistantVersion {
            assistant_id: self.assistant_id,
            version: self.version,
            graph_id: self.graph_id.clone(),
            config: self.config.clone(),
            metadata: self.metadata.clone(),
            name: self.name.clone(),
            created_at: self.updated_at,
        }
    }
}

/// An immutable snapshot of an assistant at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantVersion {
    pub assistant_id: Uuid,
    pub version: u32,
    pub graph_id: String,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub metadata: JsonMap,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_assistant_defaults_name_to_graph_id() {
        let a = Assistant::new(Uuid::new_v4(), "agent", RunConfig::default(), JsonMap::new(), None);
        assert_eq!(a.name, "agent");
        assert_eq!(a.version, 1);
    }

    #[test]
    fn test_version_snapshot_mirrors_live_record() {
        let a = Assistant::new(
            Uuid::new_v4(),
            "agent",
            RunConfig::default(),
            JsonMap::new(),
            Some("custom".to_string()),
        );
        let v = a.as_version();
        assert_eq!(v.assistant_id, a.assistant_id);
        assert_eq!(v.version, 1);
        assert_eq!(v.name, "custom");
        assert_eq!(v.graph_id, "agent");
    }
}
