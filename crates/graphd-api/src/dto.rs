//! Request and response bodies for the HTTP boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use graphd_core::checkpoint::CheckpointRef;
use graphd_core::graph::Superstep;
use graphd_core::types::{
    CancelAction, IfExists, JsonMap, RunConfig, RunStatus, ThreadStatus,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadCreateRequest {
    #[serde(default)]
    pub thread_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub if_exists: IfExists,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadSearchRequest {
    #[serde(default)]
    pub status: Option<ThreadStatus>,
    #[serde(default)]
    pub values: Option<Value>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadPatchRequest {
    pub metadata: JsonMap,
}

/// Body of `POST /threads/:id/state`.
#[derive(Debug, Clone, Deserialize)]
pub struct StateUpdateRequest {
    pub values: Value,
    #[serde(default)]
    pub as_node: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointBody>,
}

impl StateUpdateRequest {
    /// Checkpoint addressed by either the flat field or the nested form.
    pub fn target_checkpoint(&self) -> Option<String> {
        self.checkpoint_id.clone().or_else(|| {
            self.checkpoint
                .as_ref()
                .and_then(|body| body.checkpoint_id.clone())
        })
    }
}

/// Nested checkpoint address as it appears in request bodies.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointBody {
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub checkpoint_ns: Option<String>,
}

/// Body of `POST /threads/:id/state/checkpoint`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateAtCheckpointRequest {
    #[serde(default)]
    pub checkpoint: Option<CheckpointBody>,
    #[serde(default)]
    pub subgraphs: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateUpdateResponse {
    pub checkpoint: CheckpointRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
}

/// Body of `POST /threads/state/batch`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchStateRequest {
    pub supersteps: Vec<Superstep>,
    #[serde(default)]
    pub thread_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default = "batch_if_exists")]
    pub if_exists: IfExists,
}

fn batch_if_exists() -> IfExists {
    // Batch targets an existing thread when one is named.
    IfExists::DoNothing
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantCreateRequest {
    #[serde(default)]
    pub assistant_id: Option<Uuid>,
    pub graph_id: String,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub if_exists: IfExists,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantPatchRequest {
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub config: Option<RunConfig>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantSearchRequest {
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetLatestRequest {
    pub version: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunCancelRequest {
    #[serde(default)]
    pub action: CancelAction,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunListQuery {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Query string of the state and stream GET endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubgraphsQuery {
    #[serde(default)]
    pub subgraphs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub before: Option<String>,
}
