//! The opaque graph interface.
//!
//! graphd hosts graph computations but does not implement them: a graph is an
//! external object reached through the six operations below (invoke, stream,
//! get_state, update_state, bulk_update_state, get_state_history). Keeping
//! the seam this narrow keeps the core portable and testable with a mock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::checkpoint::{Checkpointer, CheckpointerError, CheckpointRef};
use crate::kv::KvStore;
use crate::types::{JsonMap, RunConfig, StreamMode};

/// Graph-side failures, classified for the executor's retry policy.
#[derive(Debug, Error)]
pub enum GraphError {
    /// I/O-class failure worth retrying with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Unrecoverable failure; the run goes to `error`.
    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointerError),
}

impl GraphError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::Transient(_))
            || matches!(self, GraphError::Checkpoint(CheckpointerError::Io(_)))
    }
}

/// What a graph invocation starts from: fresh input, or a command resuming an
/// interrupted execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphInput {
    Input(Value),
    Command(Value),
}

/// One chunk of streamed graph output, tagged with its stream mode.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub mode: StreamMode,
    pub data: Value,
}

/// Stream of incremental graph output.
pub type GraphStream = BoxStream<'static, Result<StreamChunk, GraphError>>;

/// One task inside a state snapshot. Interrupt payloads raised by the task
/// surface here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDescription {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupts: Vec<Value>,
}

/// Snapshot of graph state at one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub values: Value,
    /// Nodes scheduled to run next; non-empty means the graph is paused.
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskDescription>,
    pub checkpoint: CheckpointRef,
    #[serde(default)]
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint: Option<CheckpointRef>,
}

impl StateSnapshot {
    /// Interrupt payloads keyed by task id, the projection threads store.
    pub fn interrupts(&self) -> HashMap<String, Value> {
        self.tasks
            .iter()
            .filter(|task| !task.interrupts.is_empty())
            .map(|task| (task.id.clone(), Value::Array(task.interrupts.clone())))
            .collect()
    }
}

/// One state update inside a superstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub values: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_node: Option<String>,
}

/// A batch of state updates applied as one logical step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Superstep {
    pub updates: Vec<StateUpdate>,
}

/// The external graph object.
#[async_trait]
pub trait Graph: Send + Sync {
    /// Run to completion and return the final values.
    async fn invoke(&self, input: GraphInput, config: &RunConfig) -> Result<Value, GraphError>;

    /// Run while streaming chunks on the requested modes.
    async fn stream(
        &self,
        input: GraphInput,
        config: &RunConfig,
        stream_mode: &[StreamMode],
    ) -> Result<GraphStream, GraphError>;

    /// Read the state snapshot addressed by `config`.
    async fn get_state(
        &self,
        config: &CheckpointRef,
        subgraphs: bool,
    ) -> Result<Option<StateSnapshot>, GraphError>;

    /// Apply a single state update, optionally attributed to a node.
    async fn update_state(
        &self,
        config: &CheckpointRef,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointRef, GraphError>;

    /// Apply a sequence of supersteps in order.
    async fn bulk_update_state(
        &self,
        config: &CheckpointRef,
        supersteps: Vec<Superstep>,
    ) -> Result<CheckpointRef, GraphError>;

    /// State history, newest first.
    async fn get_state_history(
        &self,
        config: &CheckpointRef,
        limit: Option<usize>,
        before: Option<&str>,
        metadata: Option<&JsonMap>,
    ) -> Result<Vec<StateSnapshot>, GraphError>;
}

/// Dependencies handed to a graph factory when a graph is materialized.
#[derive(Clone)]
pub struct GraphContext {
    pub checkpointer: Arc<dyn Checkpointer>,
    pub store: Arc<dyn KvStore>,
}

/// Builds graph instances wired against the server's storage.
#[async_trait]
pub trait GraphFactory: Send + Sync {
    async fn build(&self, ctx: GraphContext) -> Result<Arc<dyn Graph>, GraphError>;
}

/// Registry of installed graphs, populated at startup from configuration.
#[derive(Default)]
pub struct GraphRegistry {
    factories: HashMap<String, Arc<dyn GraphFactory>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, graph_id: impl Into<String>, factory: Arc<dyn GraphFactory>) {
        self.factories.insert(graph_id.into(), factory);
    }

    pub fn get(&self, graph_id: &str) -> Option<Arc<dyn GraphFactory>> {
        self.factories.get(graph_id).cloned()
    }

    pub fn contains(&self, graph_id: &str) -> bool {
        self.factories.contains_key(graph_id)
    }

    pub fn graph_ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_interrupts_projection_skips_quiet_tasks() {
        let snapshot = StateSnapshot {
            values: json!({}),
            next: vec!["ask".to_string()],
            tasks: vec![
                TaskDescription {
                    id: "t1".to_string(),
                    name: "ask".to_string(),
                    error: None,
                    interrupts: vec![json!({"question": "proceed?"})],
                },
                TaskDescription {
                    id: "t2".to_string(),
                    name: "fetch".to_string(),
                    ..TaskDescription::default()
                },
            ],
            checkpoint: CheckpointRef::latest(uuid::Uuid::new_v4()),
            metadata: JsonMap::new(),
            created_at: Utc::now(),
            parent_checkpoint: None,
        };

        let interrupts = snapshot.interrupts();
        assert_eq!(interrupts.len(), 1);
        assert_eq!(interrupts["t1"], json!([{"question": "proceed?"}]));
    }

    #[test]
    fn test_transient_classification() {
        assert!(GraphError::Transient("socket reset".to_string()).is_transient());
        assert!(GraphError::Checkpoint(CheckpointerError::Io("disk".to_string())).is_transient());
        assert!(!GraphError::Fatal("bad input".to_string()).is_transient());
    }
}
