//! Mock graph for exercising the run pipeline without a real graph library.
//!
//! `MockGraph` walks a scripted list of value payloads, records a checkpoint
//! per step through the injected [`Checkpointer`], and streams each payload
//! on the `values` mode (plus `updates` when requested). Checkpoint payloads
//! follow the shape `{"values": .., "next": [..], "tasks": [..]}` so state
//! reads can rebuild a [`StateSnapshot`] from storage alone.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::checkpoint::{Checkpointer, CheckpointRef, CheckpointTuple};
use crate::graph::{
    Graph, GraphError, GraphInput, GraphStream, StateSnapshot, StateUpdate, StreamChunk, Superstep,
    TaskDescription,
};
use crate::types::{map_contains_subset, JsonMap, RunConfig, StreamMode};

/// Scripted failure injected into the stream.
#[derive(Debug, Clone)]
struct MockFailure {
    after_chunks: usize,
    transient: bool,
    message: String,
}

#[derive(Clone)]
pub struct MockGraph {
    checkpointer: Arc<dyn Checkpointer>,
    steps: Option<Vec<Value>>,
    step_delay: Duration,
    final_next: Vec<String>,
    final_tasks: Vec<TaskDescription>,
    failure: Option<MockFailure>,
}

impl MockGraph {
    pub fn new(checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            checkpointer,
            steps: None,
            step_delay: Duration::ZERO,
            final_next: Vec::new(),
            final_tasks: Vec::new(),
            failure: None,
        }
    }

    /// Emit these payloads instead of echoing the input.
    pub fn with_steps(mut self, steps: Vec<Value>) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Sleep before each step; gives cancellation tests a window.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Leave the graph paused on these nodes after the last step.
    pub fn with_final_next(mut self, next: Vec<String>) -> Self {
        self.final_next = next;
        self
    }

    /// Attach task descriptions (e.g. interrupt payloads) to the final state.
    pub fn with_final_tasks(mut self, tasks: Vec<TaskDescription>) -> Self {
        self.final_tasks = tasks;
        self
    }

    /// Fail the stream after `after_chunks` chunks were produced.
    pub fn with_failure_after(mut self, after_chunks: usize, transient: bool, message: &str) -> Self {
        self.failure = Some(MockFailure {
            after_chunks,
            transient,
            message: message.to_string(),
        });
        self
    }

    fn resolve_steps(&self, input: &GraphInput) -> Vec<Value> {
        if let Some(steps) = &self.steps {
            return steps.clone();
        }
        match input {
            GraphInput::Input(value) | GraphInput::Command(value) => vec![value.clone()],
        }
    }

    fn failure_error(failure: &MockFailure) -> GraphError {
        if failure.transient {
            GraphError::Transient(failure.message.clone())
        } else {
            GraphError::Fatal(failure.message.clone())
        }
    }
}

fn thread_of(config: &RunConfig) -> Result<Uuid, GraphError> {
    config
        .configurable
        .get("thread_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| GraphError::Fatal("missing configurable.thread_id".to_string()))
}

fn checkpoint_payload(values: &Value, next: &[String], tasks: &[TaskDescription]) -> Value {
    json!({
        "values": values,
        "next": next,
        "tasks": tasks,
    })
}

fn checkpoint_metadata(step: usize, source: &str, run_id: Option<&Value>) -> JsonMap {
    let mut metadata = JsonMap::new();
    metadata.insert("step".to_string(), json!(step));
    metadata.insert("source".to_string(), json!(source));
    metadata.insert("created_at".to_string(), json!(Utc::now().to_rfc3339()));
    if let Some(run_id) = run_id {
        metadata.insert("run_id".to_string(), run_id.clone());
    }
    metadata
}

fn snapshot_from_tuple(tuple: &CheckpointTuple) -> StateSnapshot {
    let values = tuple
        .checkpoint
        .get("values")
        .cloned()
        .unwrap_or(Value::Null);
    let next = tuple
        .checkpoint
        .get("next")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let tasks = tuple
        .checkpoint
        .get("tasks")
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
        .unwrap_or_default();
    let created_at = tuple
        .metadata
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    StateSnapshot {
        values,
        next,
        tasks,
        checkpoint: tuple.config.clone(),
        metadata: tuple.metadata.clone(),
        created_at,
        parent_checkpoint: tuple.parent.clone(),
    }
}

fn merge_values(current: &Value, update: &Value) -> Value {
    match (current, update) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => update.clone(),
    }
}

#[async_trait]
impl Graph for MockGraph {
    async fn invoke(&self, input: GraphInput, config: &RunConfig) -> Result<Value, GraphError> {
        let mut stream = self
            .stream(input, config, &[StreamMode::Values])
            .await?;
        let mut last = Value::Null;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.mode == StreamMode::Values {
                last = chunk.data;
            }
        }
        Ok(last)
    }

    async fn stream(
        &self,
        input: GraphInput,
        config: &RunConfig,
        stream_mode: &[StreamMode],
    ) -> Result<GraphStream, GraphError> {
        let thread_id = thread_of(config)?;
        let run_id = config.configurable.get("run_id").cloned();
        let steps = self.resolve_steps(&input);
        let checkpointer = self.checkpointer.clone();
        let delay = self.step_delay;
        let final_next = self.final_next.clone();
        let final_tasks = self.final_tasks.clone();
        let failure = self.failure.clone();
        let want_values = stream_mode.contains(&StreamMode::Values);
        let want_updates = stream_mode.contains(&StreamMode::Updates);

        let stream = try_stream! {
            let mut produced = 0usize;
            let total = steps.len();
            let mut values = Value::Null;
            for (index, step) in steps.into_iter().enumerate() {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Some(failure) = &failure {
                    if produced >= failure.after_chunks {
                        Err::<(), GraphError>(MockGraph::failure_error(failure))?;
                    }
                }

                values = merge_values(&values, &step);
                let last = index + 1 == total;
                let next: Vec<String> = if last {
                    final_next.clone()
                } else {
                    vec![format!("step_{}", index + 1)]
                };
                let tasks = if last { final_tasks.clone() } else { Vec::new() };
                checkpointer
                    .put(
                        &CheckpointRef::latest(thread_id),
                        checkpoint_payload(&values, &next, &tasks),
                        checkpoint_metadata(index, "loop", run_id.as_ref()),
                    )
                    .await?;

                if want_values {
                    produced += 1;
                    yield StreamChunk { mode: StreamMode::Values, data: values.clone() };
                }
                if want_updates {
                    produced += 1;
                    let mut update = JsonMap::new();
                    update.insert(format!("step_{index}"), step);
                    yield StreamChunk {
                        mode: StreamMode::Updates,
                        data: Value::Object(update),
                    };
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn get_state(
        &self,
        config: &CheckpointRef,
        _subgraphs: bool,
    ) -> Result<Option<StateSnapshot>, GraphError> {
        let tuple = self.checkpointer.get_tuple(config).await?;
        Ok(tuple.as_ref().map(snapshot_from_tuple))
    }

    async fn update_state(
        &self,
        config: &CheckpointRef,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointRef, GraphError> {
        let current = self.checkpointer.get_tuple(config).await?;
        let merged = match &current {
            Some(tuple) => {
                let existing = tuple.checkpoint.get("values").cloned().unwrap_or(Value::Null);
                merge_values(&existing, &values)
            }
            None => values.clone(),
        };
        let step = current
            .as_ref()
            .and_then(|tuple| tuple.metadata.get("step"))
            .and_then(Value::as_u64)
            .map(|step| step as usize + 1)
            .unwrap_or(0);

        let mut metadata = checkpoint_metadata(step, "update", None);
        if let Some(node) = as_node {
            let mut writes = JsonMap::new();
            writes.insert(node.to_string(), values.clone());
            metadata.insert("writes".to_string(), Value::Object(writes));
        }
        let stored = self
            .checkpointer
            .put(
                &CheckpointRef::latest(config.thread_id),
                checkpoint_payload(&merged, &[], &[]),
                metadata,
            )
            .await?;
        Ok(stored)
    }

    async fn bulk_update_state(
        &self,
        config: &CheckpointRef,
        supersteps: Vec<Superstep>,
    ) -> Result<CheckpointRef, GraphError> {
        let mut latest = CheckpointRef::latest(config.thread_id);
        for superstep in supersteps {
            let mut combined = Value::Null;
            let mut as_node = None;
            for StateUpdate { values, as_node: node } in superstep.updates {
                combined = merge_values(&combined, &values);
                as_node = node.or(as_node);
            }
            latest = self
                .update_state(&CheckpointRef::latest(config.thread_id), combined, as_node.as_deref())
                .await?;
        }
        Ok(latest)
    }

    async fn get_state_history(
        &self,
        config: &CheckpointRef,
        limit: Option<usize>,
        before: Option<&str>,
        metadata: Option<&JsonMap>,
    ) -> Result<Vec<StateSnapshot>, GraphError> {
        let tuples = self.checkpointer.list(config, limit, before).await?;
        Ok(tuples
            .iter()
            .filter(|tuple| match metadata {
                Some(filter) => map_contains_subset(&tuple.metadata, filter),
                None => true,
            })
            .map(snapshot_from_tuple)
            .collect())
    }
}

/// Factory producing [`MockGraph`] clones of one template, rebound to the
/// checkpointer the runtime injects.
pub struct MockGraphFactory {
    template: MockGraph,
}

impl MockGraphFactory {
    pub fn new(template: MockGraph) -> Self {
        Self { template }
    }
}

#[async_trait]
impl crate::graph::GraphFactory for MockGraphFactory {
    async fn build(
        &self,
        ctx: crate::graph::GraphContext,
    ) -> Result<Arc<dyn Graph>, GraphError> {
        let mut graph = self.template.clone();
        graph.checkpointer = ctx.checkpointer;
        Ok(Arc::new(graph))
    }
}
