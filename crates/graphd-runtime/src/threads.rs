//! Thread service - CRUD, derived status, and the graph-state sub-interface.
//!
//! Thread status is never set directly from the outside: it is derived from
//! the latest checkpoint and the thread's pending runs by [`Threads::set_status`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use graphd_core::checkpoint::CheckpointRef;
use graphd_core::graph::{Graph, GraphContext, GraphRegistry, StateSnapshot, Superstep};
use graphd_core::kv::KvStore;
use graphd_core::types::{
    contains_subset, map_contains_subset, CancelAction, IfExists, JsonMap, Thread, ThreadStatus,
};
use graphd_stores::{CheckpointerProxy, StateStore, StreamBus};

use crate::error::RuntimeError;

/// Search filter for threads.
#[derive(Debug, Clone, Default)]
pub struct ThreadSearch {
    pub status: Option<ThreadStatus>,
    pub values: Option<Value>,
    pub metadata: Option<JsonMap>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone)]
pub struct Threads {
    state: Arc<StateStore>,
    bus: Arc<StreamBus>,
    checkpointer: CheckpointerProxy,
    graphs: Arc<GraphRegistry>,
    kv: Arc<dyn KvStore>,
}

impl Threads {
    pub fn new(
        state: Arc<StateStore>,
        bus: Arc<StreamBus>,
        checkpointer: CheckpointerProxy,
        graphs: Arc<GraphRegistry>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            state,
            bus,
            checkpointer,
            graphs,
            kv,
        }
    }

    pub async fn search(&self, query: ThreadSearch) -> Result<Vec<Thread>, RuntimeError> {
        let shard = self.state.threads().await;
        let mut matches: Vec<Thread> = shard
            .threads
            .values()
            .filter(|thread| match query.status {
                Some(status) => thread.status == status,
                None => true,
            })
            .filter(|thread| match &query.values {
                Some(filter) => thread
                    .values
                    .as_ref()
                    .map(|values| contains_subset(values, filter))
                    .unwrap_or(false),
                None => true,
            })
            .filter(|thread| match &query.metadata {
                Some(filter) => map_contains_subset(&thread.metadata, filter),
                None => true,
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(10);
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn get(&self, thread_id: Uuid) -> Result<Thread, RuntimeError> {
        self.state
            .threads()
            .await
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found("thread", thread_id))
    }

    pub async fn put(
        &self,
        thread_id: Uuid,
        metadata: JsonMap,
        if_exists: IfExists,
    ) -> Result<Thread, RuntimeError> {
        let mut shard = self.state.threads_mut().await;
        if let Some(existing) = shard.threads.get(&thread_id) {
            return match if_exists {
                IfExists::DoNothing => Ok(existing.clone()),
                IfExists::Raise => Err(RuntimeError::Conflict(format!(
                    "thread '{thread_id}' already exists"
                ))),
            };
        }
        let thread = Thread::new(thread_id, metadata, ThreadStatus::Idle);
        shard.threads.insert(thread_id, thread.clone());
        Ok(thread)
    }

    /// Shallow-merge metadata into the thread.
    pub async fn patch(&self, thread_id: Uuid, metadata: JsonMap) -> Result<Thread, RuntimeError> {
        let mut shard = self.state.threads_mut().await;
        let thread = shard
            .threads
            .get_mut(&thread_id)
            .ok_or_else(|| RuntimeError::not_found("thread", thread_id))?;
        for (key, value) in metadata {
            thread.metadata.insert(key, value);
        }
        thread.touch();
        Ok(thread.clone())
    }

    /// Copy a thread: fresh id, inherited metadata and values, checkpoints
    /// duplicated through the checkpointer.
    pub async fn copy(&self, thread_id: Uuid) -> Result<Thread, RuntimeError> {
        let source = self.get(thread_id).await?;
        let copy_id = Uuid::new_v4();
        self.checkpointer.copy_thread(thread_id, copy_id).await?;

        let now = Utc::now();
        let mut copy = Thread::new(copy_id, source.metadata.clone(), ThreadStatus::Idle);
        copy.config = source.config.clone();
        copy.values = source.values.clone();
        copy.created_at = now;
        copy.updated_at = now;

        let mut shard = self.state.threads_mut().await;
        shard.threads.insert(copy_id, copy.clone());
        Ok(copy)
    }

    /// Delete the thread, its runs, and its checkpoints. In-flight runs are
    /// fired with an interrupt so the executor lets go promptly.
    pub async fn delete(&self, thread_id: Uuid) -> Result<(), RuntimeError> {
        {
            let mut shard = self.state.threads_mut().await;
            if shard.threads.remove(&thread_id).is_none() {
                return Err(RuntimeError::not_found("thread", thread_id));
            }
        }

        let mut runs = self.state.runs_mut().await;
        let cascaded: Vec<Uuid> = runs
            .runs
            .values()
            .filter(|run| run.thread_id == thread_id)
            .map(|run| run.run_id)
            .collect();
        for run_id in cascaded {
            if let Some(control) = self.bus.control(run_id) {
                control.fire(CancelAction::Interrupt);
            }
            runs.forget(run_id);
            self.bus.drop_queue(run_id);
        }
        drop(runs);

        self.checkpointer.delete_thread(thread_id).await?;
        Ok(())
    }

    /// Derive and store thread status from an optional checkpoint snapshot
    /// and an optional error:
    ///
    /// 1. error present        -> `error`
    /// 2. checkpoint has next  -> `interrupted`
    /// 3. any pending run      -> `busy`
    /// 4. otherwise            -> `idle`
    pub async fn set_status(
        &self,
        thread_id: Uuid,
        checkpoint: Option<&StateSnapshot>,
        error: Option<&str>,
    ) -> Result<Thread, RuntimeError> {
        let mut shard = self.state.threads_mut().await;
        // Lock order: threads before runs.
        let has_pending = self.state.runs().await.has_pending(thread_id);
        let thread = shard
            .threads
            .get_mut(&thread_id)
            .ok_or_else(|| RuntimeError::not_found("thread", thread_id))?;

        thread.status = if error.is_some() {
            ThreadStatus::Error
        } else if checkpoint.map(|cp| !cp.next.is_empty()).unwrap_or(false) {
            ThreadStatus::Interrupted
        } else if has_pending {
            ThreadStatus::Busy
        } else {
            ThreadStatus::Idle
        };

        match checkpoint {
            Some(snapshot) => {
                thread.values = Some(snapshot.values.clone());
                thread.interrupts = snapshot.interrupts();
            }
            None => {
                thread.values = None;
                thread.interrupts.clear();
            }
        }
        thread.touch();
        Ok(thread.clone())
    }

    /// Build the graph bound to this thread, or fail when the thread has no
    /// graph recorded yet.
    pub(crate) async fn graph_for(&self, thread: &Thread) -> Result<Arc<dyn Graph>, RuntimeError> {
        let graph_id = thread.graph_id().ok_or_else(|| {
            RuntimeError::BadRequest(format!(
                "thread '{}' has no graph bound to it",
                thread.thread_id
            ))
        })?;
        self.build_graph(graph_id).await
    }

    pub(crate) async fn build_graph(&self, graph_id: &str) -> Result<Arc<dyn Graph>, RuntimeError> {
        let factory = self.graphs.get(graph_id).ok_or_else(|| {
            RuntimeError::BadRequest(format!("graph '{graph_id}' is not registered"))
        })?;
        let graph = factory
            .build(GraphContext {
                checkpointer: self.checkpointer.backend(),
                store: Arc::clone(&self.kv),
            })
            .await?;
        Ok(graph)
    }

    /// Current state snapshot, or the snapshot at one checkpoint.
    ///
    /// A thread with no graph bound yet reports its stored values with no
    /// execution frontier.
    pub async fn state_get(
        &self,
        thread_id: Uuid,
        checkpoint_id: Option<&str>,
        subgraphs: bool,
    ) -> Result<StateSnapshot, RuntimeError> {
        let thread = self.get(thread_id).await?;
        if thread.graph_id().is_none() {
            return Ok(empty_snapshot(&thread));
        }
        let graph = self.graph_for(&thread).await?;
        let config = match checkpoint_id {
            Some(id) => CheckpointRef::at(thread_id, id),
            None => CheckpointRef::latest(thread_id),
        };
        let snapshot = graph.get_state(&config, subgraphs).await?;
        Ok(snapshot.unwrap_or_else(|| empty_snapshot(&thread)))
    }

    /// Apply a single state update and fold the resulting values back into
    /// the thread.
    pub async fn state_post(
        &self,
        thread_id: Uuid,
        values: Value,
        as_node: Option<&str>,
        checkpoint_id: Option<&str>,
    ) -> Result<CheckpointRef, RuntimeError> {
        let thread = self.get(thread_id).await?;
        let graph = self.graph_for(&thread).await?;
        let config = match checkpoint_id {
            Some(id) => CheckpointRef::at(thread_id, id),
            None => CheckpointRef::latest(thread_id),
        };
        let stored = graph.update_state(&config, values, as_node).await?;
        self.refresh_from_graph(thread_id, graph.as_ref()).await?;
        Ok(stored)
    }

    /// Apply a sequence of supersteps as bulk updates.
    pub async fn state_batch(
        &self,
        thread_id: Option<Uuid>,
        supersteps: Vec<Superstep>,
        metadata: JsonMap,
        if_exists: IfExists,
    ) -> Result<Thread, RuntimeError> {
        let thread_id = thread_id.unwrap_or_else(Uuid::new_v4);
        let thread = match self.get(thread_id).await {
            Ok(existing) => match if_exists {
                IfExists::DoNothing => existing,
                IfExists::Raise => {
                    return Err(RuntimeError::Conflict(format!(
                        "thread '{thread_id}' already exists"
                    )))
                }
            },
            Err(RuntimeError::NotFound(_)) => self.put(thread_id, metadata, IfExists::Raise).await?,
            Err(err) => return Err(err),
        };

        let graph = self.graph_for(&thread).await?;
        graph
            .bulk_update_state(&CheckpointRef::latest(thread_id), supersteps)
            .await?;
        self.refresh_from_graph(thread_id, graph.as_ref()).await
    }

    /// State history, newest first. Threads without a graph have none.
    pub async fn state_history(
        &self,
        thread_id: Uuid,
        limit: Option<usize>,
        before: Option<&str>,
        metadata: Option<&JsonMap>,
    ) -> Result<Vec<StateSnapshot>, RuntimeError> {
        let thread = self.get(thread_id).await?;
        if thread.graph_id().is_none() {
            return Ok(Vec::new());
        }
        let graph = self.graph_for(&thread).await?;
        let history = graph
            .get_state_history(&CheckpointRef::latest(thread_id), limit, before, metadata)
            .await?;
        Ok(history)
    }

    async fn refresh_from_graph(
        &self,
        thread_id: Uuid,
        graph: &dyn Graph,
    ) -> Result<Thread, RuntimeError> {
        let snapshot = graph
            .get_state(&CheckpointRef::latest(thread_id), false)
            .await?;
        self.set_status(thread_id, snapshot.as_ref(), None).await
    }
}

fn empty_snapshot(thread: &Thread) -> StateSnapshot {
    StateSnapshot {
        values: thread.values.clone().unwrap_or(Value::Null),
        next: Vec::new(),
        tasks: Vec::new(),
        checkpoint: CheckpointRef::latest(thread.thread_id),
        metadata: JsonMap::new(),
        created_at: thread.updated_at,
        parent_checkpoint: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphd_core::graph::{StateUpdate, TaskDescription};
    use graphd_core::mock::{MockGraph, MockGraphFactory};
    use graphd_core::types::{MultitaskStrategy, Run, RunKwargs, RunStatus};
    use serde_json::json;

    fn service() -> (Threads, Arc<StateStore>) {
        let state = Arc::new(StateStore::in_memory());
        let bus = Arc::new(StreamBus::new());
        let checkpointer = CheckpointerProxy::in_memory();
        let mut graphs = GraphRegistry::new();
        graphs.register(
            "agent",
            Arc::new(MockGraphFactory::new(MockGraph::new(
                checkpointer.backend(),
            ))),
        );
        let threads = Threads::new(
            Arc::clone(&state),
            bus,
            checkpointer,
            Arc::new(graphs),
            Arc::new(graphd_stores::InMemoryKvStore::new()),
        );
        (threads, state)
    }

    fn graph_metadata() -> JsonMap {
        let mut metadata = JsonMap::new();
        metadata.insert("graph_id".to_string(), json!("agent"));
        metadata
    }

    async fn insert_pending_run(state: &StateStore, thread_id: Uuid) {
        let now = Utc::now();
        let run = Run {
            run_id: Uuid::new_v4(),
            thread_id,
            assistant_id: Uuid::new_v4(),
            status: RunStatus::Pending,
            kwargs: RunKwargs::default(),
            multitask_strategy: MultitaskStrategy::default(),
            metadata: JsonMap::new(),
            created_at: now,
            updated_at: now,
        };
        state.runs_mut().await.runs.insert(run.run_id, run);
    }

    #[test]
    fn test_put_get_round_trip_and_conflict() {
        tokio_test::block_on(async {
            let (threads, _) = service();
            let thread_id = Uuid::new_v4();
            let created = threads
                .put(thread_id, JsonMap::new(), IfExists::Raise)
                .await
                .unwrap();
            let fetched = threads.get(thread_id).await.unwrap();
            assert_eq!(fetched.thread_id, created.thread_id);
            assert_eq!(fetched.status, ThreadStatus::Idle);

            assert!(matches!(
                threads.put(thread_id, JsonMap::new(), IfExists::Raise).await,
                Err(RuntimeError::Conflict(_))
            ));
            let unchanged = threads
                .put(thread_id, graph_metadata(), IfExists::DoNothing)
                .await
                .unwrap();
            assert!(unchanged.metadata.is_empty());
        });
    }

    #[test]
    fn test_set_status_derivation_order() {
        tokio_test::block_on(async {
            let (threads, state) = service();
            let thread_id = Uuid::new_v4();
            threads
                .put(thread_id, JsonMap::new(), IfExists::Raise)
                .await
                .unwrap();

            // Error beats everything.
            let errored = threads
                .set_status(thread_id, None, Some("boom"))
                .await
                .unwrap();
            assert_eq!(errored.status, ThreadStatus::Error);
            assert!(errored.values.is_none());

            // Non-empty next means interrupted, and interrupts project in.
            let snapshot = StateSnapshot {
                values: json!({"x": 1}),
                next: vec!["ask".to_string()],
                tasks: vec![TaskDescription {
                    id: "t1".to_string(),
                    name: "ask".to_string(),
                    error: None,
                    interrupts: vec![json!({"q": "?"})],
                }],
                checkpoint: CheckpointRef::latest(thread_id),
                metadata: JsonMap::new(),
                created_at: Utc::now(),
                parent_checkpoint: None,
            };
            let interrupted = threads
                .set_status(thread_id, Some(&snapshot), None)
                .await
                .unwrap();
            assert_eq!(interrupted.status, ThreadStatus::Interrupted);
            assert_eq!(interrupted.values, Some(json!({"x": 1})));
            assert!(interrupted.interrupts.contains_key("t1"));

            // Pending run means busy when the frontier is empty.
            insert_pending_run(&state, thread_id).await;
            let quiet = StateSnapshot {
                next: Vec::new(),
                tasks: Vec::new(),
                ..snapshot
            };
            let busy = threads
                .set_status(thread_id, Some(&quiet), None)
                .await
                .unwrap();
            assert_eq!(busy.status, ThreadStatus::Busy);
            assert!(busy.interrupts.is_empty());

            // Otherwise idle.
            state.runs_mut().await.runs.clear();
            let idle = threads
                .set_status(thread_id, Some(&quiet), None)
                .await
                .unwrap();
            assert_eq!(idle.status, ThreadStatus::Idle);
        });
    }

    #[test]
    fn test_state_post_requires_graph() {
        tokio_test::block_on(async {
            let (threads, _) = service();
            let thread_id = Uuid::new_v4();
            threads
                .put(thread_id, JsonMap::new(), IfExists::Raise)
                .await
                .unwrap();
            let err = threads
                .state_post(thread_id, json!({"x": 1}), None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::BadRequest(_)));
            assert!(threads
                .state_history(thread_id, None, None, None)
                .await
                .unwrap()
                .is_empty());
        });
    }

    #[test]
    fn test_state_post_updates_thread_values() {
        tokio_test::block_on(async {
            let (threads, _) = service();
            let thread_id = Uuid::new_v4();
            threads
                .put(thread_id, graph_metadata(), IfExists::Raise)
                .await
                .unwrap();

            threads
                .state_post(thread_id, json!({"x": 1}), Some("editor"), None)
                .await
                .unwrap();
            let thread = threads.get(thread_id).await.unwrap();
            assert_eq!(thread.values, Some(json!({"x": 1})));
            assert_eq!(thread.status, ThreadStatus::Idle);

            let state = threads.state_get(thread_id, None, false).await.unwrap();
            assert_eq!(state.values, json!({"x": 1}));
        });
    }

    #[test]
    fn test_state_batch_applies_supersteps_in_order() {
        tokio_test::block_on(async {
            let (threads, _) = service();
            let thread = threads
                .state_batch(
                    None,
                    vec![
                        Superstep {
                            updates: vec![StateUpdate {
                                values: json!({"a": 1}),
                                as_node: None,
                            }],
                        },
                        Superstep {
                            updates: vec![StateUpdate {
                                values: json!({"b": 2}),
                                as_node: None,
                            }],
                        },
                        Superstep {
                            updates: vec![StateUpdate {
                                values: json!({"a": 3}),
                                as_node: None,
                            }],
                        },
                    ],
                    graph_metadata(),
                    IfExists::Raise,
                )
                .await
                .unwrap();

            assert_eq!(thread.values, Some(json!({"a": 3, "b": 2})));

            let history = threads
                .state_history(thread.thread_id, Some(10), None, None)
                .await
                .unwrap();
            assert!(history.len() >= 3);
            // Newest first.
            assert_eq!(history[0].values, json!({"a": 3, "b": 2}));
            assert_eq!(history[2].values, json!({"a": 1}));
        });
    }

    #[test]
    fn test_copy_inherits_metadata_and_checkpoints() {
        tokio_test::block_on(async {
            let (threads, _) = service();
            let thread_id = Uuid::new_v4();
            threads
                .put(thread_id, graph_metadata(), IfExists::Raise)
                .await
                .unwrap();
            threads
                .state_post(thread_id, json!({"seed": true}), None, None)
                .await
                .unwrap();

            let copy = threads.copy(thread_id).await.unwrap();
            assert_ne!(copy.thread_id, thread_id);
            assert_eq!(copy.metadata.get("graph_id"), Some(&json!("agent")));

            let copied_state = threads
                .state_get(copy.thread_id, None, false)
                .await
                .unwrap();
            assert_eq!(copied_state.values, json!({"seed": true}));
        });
    }

    #[test]
    fn test_delete_cascades_runs_and_checkpoints() {
        tokio_test::block_on(async {
            let (threads, state) = service();
            let thread_id = Uuid::new_v4();
            threads
                .put(thread_id, graph_metadata(), IfExists::Raise)
                .await
                .unwrap();
            threads
                .state_post(thread_id, json!({"x": 1}), None, None)
                .await
                .unwrap();
            insert_pending_run(&state, thread_id).await;

            threads.delete(thread_id).await.unwrap();
            assert!(matches!(
                threads.get(thread_id).await,
                Err(RuntimeError::NotFound(_))
            ));
            assert!(state.runs().await.runs.is_empty());
        });
    }

    #[test]
    fn test_search_filters_status_values_metadata() {
        tokio_test::block_on(async {
            let (threads, _) = service();
            let with_graph = Uuid::new_v4();
            threads
                .put(with_graph, graph_metadata(), IfExists::Raise)
                .await
                .unwrap();
            threads
                .state_post(with_graph, json!({"kind": "demo"}), None, None)
                .await
                .unwrap();
            threads
                .put(Uuid::new_v4(), JsonMap::new(), IfExists::Raise)
                .await
                .unwrap();

            let by_metadata = threads
                .search(ThreadSearch {
                    metadata: Some(graph_metadata()),
                    ..ThreadSearch::default()
                })
                .await
                .unwrap();
            assert_eq!(by_metadata.len(), 1);

            let by_values = threads
                .search(ThreadSearch {
                    values: Some(json!({"kind": "demo"})),
                    ..ThreadSearch::default()
                })
                .await
                .unwrap();
            assert_eq!(by_values.len(), 1);

            let idle = threads
                .search(ThreadSearch {
                    status: Some(ThreadStatus::Idle),
                    ..ThreadSearch::default()
                })
                .await
                .unwrap();
            assert_eq!(idle.len(), 2);
        });
    }
}
