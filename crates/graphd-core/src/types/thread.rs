//! Thread type definitions
//!
//! A thread is a durable container for conversational state. Its status is a
//! derived projection over the latest checkpoint and the thread's pending
//! runs; `values` mirrors the latest checkpoint values.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::config::RunConfig;
use super::metadata::JsonMap;

/// Derived thread status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Busy,
    Interrupted,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: Uuid,
    pub status: ThreadStatus,
    #[serde(default)]
    pub config: RunConfig,
    /// May carry `graph_id` / `assistant_id` seeded by the first run.
    #[serde(default)]
    pub metadata: JsonMap,
    /// Latest checkpoint values, absent until the first checkpoint lands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    /// Pending interrupts keyed by task id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub interrupts: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(thread_id: Uuid, metadata: JsonMap, status: ThreadStatus) -> Self {
        let now = Utc::now();
        Self {
            thread_id,
            status,
            config: RunConfig::default(),
            metadata,
            values: None,
            interrupts: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Graph id recorded in metadata, if any.
    pub fn graph_id(&self) -> Option<&str> {
        self.metadata.get("graph_id").and_then(Value::as_str)
    }

    /// Advance `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_graph_id_reads_metadata() {
        let mut metadata = JsonMap::new();
        metadata.insert("graph_id".to_string(), json!("agent"));
        let thread = Thread::new(Uuid::new_v4(), metadata, ThreadStatus::Idle);
        assert_eq!(thread.graph_id(), Some("agent"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ThreadStatus::Interrupted).unwrap(),
            json!("interrupted")
        );
    }
}
