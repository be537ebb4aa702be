//! Assistant service - CRUD plus versioning.
//!
//! Every mutating patch records an immutable version; `set_latest` copies a
//! recorded version back into the live assistant. Deleting an assistant
//! cascades to its version records and to all of its runs.

use std::sync::Arc;

use uuid::Uuid;

use graphd_core::graph::GraphRegistry;
use graphd_core::types::{
    map_contains_subset, Assistant, AssistantVersion, IfExists, JsonMap, RunConfig,
};
use graphd_stores::{StateStore, StreamBus};

use crate::error::RuntimeError;

/// Search filter for assistants.
#[derive(Debug, Clone, Default)]
pub struct AssistantSearch {
    pub graph_id: Option<String>,
    pub metadata: Option<JsonMap>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Fields accepted by a patch; absent fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct AssistantPatch {
    pub graph_id: Option<String>,
    pub config: Option<RunConfig>,
    pub metadata: Option<JsonMap>,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct Assistants {
    state: Arc<StateStore>,
    bus: Arc<StreamBus>,
    graphs: Arc<GraphRegistry>,
}

impl Assistants {
    pub fn new(state: Arc<StateStore>, bus: Arc<StreamBus>, graphs: Arc<GraphRegistry>) -> Self {
        Self { state, bus, graphs }
    }

    /// Newest-first search with JSON-containment metadata filtering.
    pub async fn search(&self, query: AssistantSearch) -> Result<Vec<Assistant>, RuntimeError> {
        let shard = self.state.assistants().await;
        let mut matches: Vec<Assistant> = shard
            .assistants
            .values()
            .filter(|assistant| match &query.graph_id {
                Some(graph_id) => &assistant.graph_id == graph_id,
                None => true,
            })
            .filter(|assistant| match &query.metadata {
                Some(filter) => map_contains_subset(&assistant.metadata, filter),
                None => true,
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(10);
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn get(&self, assistant_id: Uuid) -> Result<Assistant, RuntimeError> {
        self.state
            .assistants()
            .await
            .assistants
            .get(&assistant_id)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found("assistant", assistant_id))
    }

    /// Create an assistant. With `IfExists::DoNothing` an existing record is
    /// returned unmodified; with `IfExists::Raise` it is a conflict.
    pub async fn put(
        &self,
        assistant_id: Uuid,
        graph_id: String,
        config: RunConfig,
        metadata: JsonMap,
        name: Option<String>,
        if_exists: IfExists,
    ) -> Result<Assistant, RuntimeError> {
        if !self.graphs.contains(&graph_id) {
            return Err(RuntimeError::Validation(format!(
                "graph '{graph_id}' is not registered"
            )));
        }

        let mut shard = self.state.assistants_mut().await;
        if let Some(existing) = shard.assistants.get(&assistant_id) {
            return match if_exists {
                IfExists::DoNothing => Ok(existing.clone()),
                IfExists::Raise => Err(RuntimeError::Conflict(format!(
                    "assistant '{assistant_id}' already exists"
                ))),
            };
        }

        let assistant = Assistant::new(assistant_id, graph_id, config, metadata, name);
        shard.versions.push(assistant.as_version());
        shard.assistants.insert(assistant_id, assistant.clone());
        Ok(assistant)
    }

    /// Apply a patch, bumping the version to max(existing) + 1 and recording
    /// the new snapshot.
    pub async fn patch(
        &self,
        assistant_id: Uuid,
        patch: AssistantPatch,
    ) -> Result<Assistant, RuntimeError> {
        if let Some(graph_id) = &patch.graph_id {
            if !self.graphs.contains(graph_id) {
                return Err(RuntimeError::Validation(format!(
                    "graph '{graph_id}' is not registered"
                )));
            }
        }

        let mut shard = self.state.assistants_mut().await;
        let max_version = shard
            .versions_of(assistant_id)
            .first()
            .map(|version| version.version)
            .unwrap_or(0);
        let assistant = shard
            .assistants
            .get_mut(&assistant_id)
            .ok_or_else(|| RuntimeError::not_found("assistant", assistant_id))?;

        if let Some(graph_id) = patch.graph_id {
            assistant.graph_id = graph_id;
        }
        if let Some(config) = patch.config {
            assistant.config = config;
        }
        if let Some(metadata) = patch.metadata {
            for (key, value) in metadata {
                assistant.metadata.insert(key, value);
            }
        }
        if let Some(name) = patch.name {
            assistant.name = name;
        }
        assistant.version = max_version + 1;
        assistant.updated_at = chrono::Utc::now();

        let snapshot = assistant.as_version();
        let updated = assistant.clone();
        shard.versions.push(snapshot);
        Ok(updated)
    }

    /// Delete the assistant, its versions, and all of its runs.
    pub async fn delete(&self, assistant_id: Uuid) -> Result<(), RuntimeError> {
        let mut shard = self.state.assistants_mut().await;
        if shard.assistants.remove(&assistant_id).is_none() {
            return Err(RuntimeError::not_found("assistant", assistant_id));
        }
        shard
            .versions
            .retain(|version| version.assistant_id != assistant_id);
        drop(shard);

        let mut runs = self.state.runs_mut().await;
        let cascaded: Vec<Uuid> = runs
            .runs
            .values()
            .filter(|run| run.assistant_id == assistant_id)
            .map(|run| run.run_id)
            .collect();
        for run_id in cascaded {
            runs.forget(run_id);
            self.bus.drop_queue(run_id);
        }
        Ok(())
    }

    /// Copy a recorded version into the live assistant.
    pub async fn set_latest(
        &self,
        assistant_id: Uuid,
        version: u32,
    ) -> Result<Assistant, RuntimeError> {
        let mut shard = self.state.assistants_mut().await;
        let snapshot = shard
            .versions
            .iter()
            .find(|record| record.assistant_id == assistant_id && record.version == version)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::NotFound(format!(
                    "assistant '{assistant_id}' version {version}"
                ))
            })?;
        let assistant = shard
            .assistants
            .get_mut(&assistant_id)
            .ok_or_else(|| RuntimeError::not_found("assistant", assistant_id))?;

        assistant.graph_id = snapshot.graph_id;
        assistant.config = snapshot.config;
        assistant.metadata = snapshot.metadata;
        assistant.name = snapshot.name;
        assistant.version = snapshot.version;
        assistant.updated_at = chrono::Utc::now();
        Ok(assistant.clone())
    }

    /// Version records of one assistant, newest first.
    pub async fn versions(
        &self,
        assistant_id: Uuid,
    ) -> Result<Vec<AssistantVersion>, RuntimeError> {
        let shard = self.state.assistants().await;
        if !shard.assistants.contains_key(&assistant_id) {
            return Err(RuntimeError::not_found("assistant", assistant_id));
        }
        Ok(shard
            .versions_of(assistant_id)
            .into_iter()
            .cloned()
            .collect())
    }

}
