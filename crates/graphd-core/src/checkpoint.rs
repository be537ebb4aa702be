//! Checkpointer trait and checkpoint addressing.
//!
//! Checkpoints are addressed by (thread_id, checkpoint_ns, checkpoint_id) and
//! their payloads are opaque to the core: graphd stores and returns them but
//! never inspects their internals. Implementations live behind
//! `Arc<dyn Checkpointer>` and own their concurrency.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::JsonMap;

/// Error type for checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointerError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("storage io: {0}")]
    Io(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Address of a checkpoint (or of a thread's latest when `checkpoint_id` is
/// absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub thread_id: Uuid,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl CheckpointRef {
    /// Address the latest checkpoint of a thread's root namespace.
    pub fn latest(thread_id: Uuid) -> Self {
        Self {
            thread_id,
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    /// Address one specific checkpoint in the root namespace.
    pub fn at(thread_id: Uuid, checkpoint_id: impl Into<String>) -> Self {
        Self {
            thread_id,
            checkpoint_ns: String::new(),
            checkpoint_id: Some(checkpoint_id.into()),
        }
    }
}

/// A stored checkpoint together with its address and lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTuple {
    pub config: CheckpointRef,
    /// Opaque graph-state payload.
    pub checkpoint: Value,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CheckpointRef>,
    /// Writes buffered against this checkpoint: (task_id, channel, value).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_writes: Vec<(String, String, Value)>,
}

/// Persistent checkpoint storage, injected into the core.
///
/// The facade is intentionally narrow: get_tuple, list, put, put_writes,
/// delete, copy, clear. Payload layout belongs to the implementation.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Load the checkpoint addressed by `config` (latest when no id is set).
    async fn get_tuple(
        &self,
        config: &CheckpointRef,
    ) -> Result<Option<CheckpointTuple>, CheckpointerError>;

    /// List checkpoints for the thread, newest first.
    async fn list(
        &self,
        config: &CheckpointRef,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<CheckpointTuple>, CheckpointerError>;

    /// Persist a checkpoint; returns the address it was stored under.
    async fn put(
        &self,
        config: &CheckpointRef,
        checkpoint: Value,
        metadata: JsonMap,
    ) -> Result<CheckpointRef, CheckpointerError>;

    /// Buffer task writes against the checkpoint addressed by `config`.
    async fn put_writes(
        &self,
        config: &CheckpointRef,
        task_id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<(), CheckpointerError>;

    /// Delete the addressed checkpoint, or every checkpoint of the thread
    /// when `config` carries no checkpoint id.
    async fn delete(&self, config: &CheckpointRef) -> Result<(), CheckpointerError>;

    /// Copy all checkpoints of one thread to another.
    async fn copy(&self, from: Uuid, to: Uuid) -> Result<(), CheckpointerError>;

    /// Drop everything. Test and shutdown tooling.
    async fn clear(&self) -> Result<(), CheckpointerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_ref_has_no_id() {
        let thread_id = Uuid::new_v4();
        let latest = CheckpointRef::latest(thread_id);
        assert_eq!(latest.thread_id, thread_id);
        assert!(latest.checkpoint_id.is_none());
        assert!(latest.checkpoint_ns.is_empty());
    }

    #[test]
    fn test_ref_round_trips_through_json() {
        let r = CheckpointRef::at(Uuid::new_v4(), "0001");
        let back: CheckpointRef =
            serde_json::from_value(serde_json::to_value(&r).unwrap()).unwrap();
        assert_eq!(back, r);
    }
}
