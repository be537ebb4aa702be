//! Run service - creation under the multitask policy, cancellation, join.
//!
//! Creation reserves a `pending` run; the picker hands it to the executor.
//! The multitask strategy is applied here against the inflight list the
//! insert step reports back.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures_util::{pin_mut, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use graphd_core::types::{
    map_contains_subset, CancelAction, IfNotExists, JsonMap, MultitaskStrategy, Run, RunConfig,
    RunKwargs, RunStatus, StreamMode, Thread, ThreadStatus,
};
use graphd_core::Checkpointer;
use graphd_stores::{BusError, CheckpointerProxy, StateStore, StreamBus, StreamMessage};

use crate::error::RuntimeError;
use crate::multitask::{decide, MultitaskDecision};
use crate::threads::Threads;

/// How long a joiner waits on the queue before re-checking the run status.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

fn default_stream_mode() -> Vec<StreamMode> {
    vec![StreamMode::Values]
}

/// Request payload for creating a run.
#[derive(Debug, Clone, Deserialize)]
pub struct RunCreate {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub assistant_id: Uuid,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub command: Option<Value>,
    #[serde(default = "default_stream_mode")]
    pub stream_mode: Vec<StreamMode>,
    #[serde(default)]
    pub interrupt_before: Vec<String>,
    #[serde(default)]
    pub interrupt_after: Vec<String>,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub multitask_strategy: MultitaskStrategy,
    #[serde(default)]
    pub if_not_exists: IfNotExists,
    #[serde(default)]
    pub after_seconds: Option<u64>,
}

impl RunCreate {
    pub fn for_assistant(assistant_id: Uuid, input: Value) -> Self {
        Self {
            run_id: None,
            assistant_id,
            input: Some(input),
            command: None,
            stream_mode: default_stream_mode(),
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
            config: RunConfig::default(),
            metadata: JsonMap::new(),
            multitask_strategy: MultitaskStrategy::default(),
            if_not_exists: IfNotExists::default(),
            after_seconds: None,
        }
    }
}

/// Result of the insert step: the run actually created (absent when the
/// inflight guard stopped the insert) plus the inflight runs found.
#[derive(Debug)]
pub struct RunInsert {
    pub run: Option<Run>,
    pub inflight: Vec<Run>,
}

/// Search filter for runs of one thread.
#[derive(Debug, Clone, Default)]
pub struct RunSearch {
    pub status: Option<RunStatus>,
    pub metadata: Option<JsonMap>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Joiner behavior.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// Token fired when the subscriber goes away.
    pub disconnect: CancellationToken,
    /// Cancel the run with `interrupt` when the subscriber disconnects.
    pub cancel_on_disconnect: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            disconnect: CancellationToken::new(),
            cancel_on_disconnect: false,
        }
    }
}

#[derive(Clone)]
pub struct Runs {
    state: Arc<StateStore>,
    bus: Arc<StreamBus>,
    checkpointer: CheckpointerProxy,
    threads: Threads,
    /// Poked on every insert so the picker reacts promptly.
    wake: Arc<Notify>,
}

impl Runs {
    pub fn new(
        state: Arc<StateStore>,
        bus: Arc<StreamBus>,
        checkpointer: CheckpointerProxy,
        threads: Threads,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            state,
            bus,
            checkpointer,
            threads,
            wake,
        }
    }

    pub fn bus(&self) -> Arc<StreamBus> {
        Arc::clone(&self.bus)
    }

    /// Create a run, applying the request's multitask strategy against the
    /// inflight runs. Returns the created run.
    pub async fn create(&self, thread_id: Uuid, request: RunCreate) -> Result<Run, RuntimeError> {
        let strategy = request.multitask_strategy;
        // The insert guard doubles as the reject fast-path; for the other
        // strategies the run is inserted first and the inflight handled after.
        let prevent_insert = strategy == MultitaskStrategy::Reject;
        let insert = self.put(thread_id, request, prevent_insert).await?;

        let Some(run) = insert.run else {
            return Err(RuntimeError::Conflict(format!(
                "thread '{thread_id}' already has {} inflight run(s)",
                insert.inflight.len()
            )));
        };

        if let MultitaskDecision::ProceedAndCancel(action) =
            decide(strategy, !insert.inflight.is_empty())
        {
            let inflight_ids: Vec<Uuid> = insert
                .inflight
                .iter()
                .map(|inflight| inflight.run_id)
                .collect();
            self.cancel(Some(thread_id), &inflight_ids, action).await?;
        }
        Ok(run)
    }

    /// Reserve a pending run: assistant check, thread resolve, inflight
    /// gathering, config synthesis, delayed scheduling.
    pub async fn put(
        &self,
        thread_id: Uuid,
        request: RunCreate,
        prevent_insert_in_inflight: bool,
    ) -> Result<RunInsert, RuntimeError> {
        let assistant = {
            let shard = self.state.assistants().await;
            shard
                .assistants
                .get(&request.assistant_id)
                .cloned()
                .ok_or_else(|| RuntimeError::not_found("assistant", request.assistant_id))?
        };

        let mut threads = self.state.threads_mut().await;
        let mut runs = self.state.runs_mut().await;

        if let Some(existing) = threads.threads.get_mut(&thread_id) {
            if existing.status != ThreadStatus::Busy {
                existing.status = ThreadStatus::Busy;
                existing.config = assistant
                    .config
                    .merged_with(&existing.config)
                    .merged_with(&request.config);
                existing.touch();
            }
        } else {
            match request.if_not_exists {
                IfNotExists::Reject => {
                    return Err(RuntimeError::not_found("thread", thread_id));
                }
                IfNotExists::Create => {
                    let mut metadata = JsonMap::new();
                    metadata.insert("graph_id".to_string(), json!(assistant.graph_id));
                    metadata
                        .insert("assistant_id".to_string(), json!(assistant.assistant_id));
                    let mut thread = Thread::new(thread_id, metadata, ThreadStatus::Busy);
                    thread.config = assistant.config.merged_with(&request.config);
                    threads.threads.insert(thread_id, thread);
                }
            }
        }
        let thread_config = threads
            .threads
            .get(&thread_id)
            .map(|thread| thread.config.clone())
            .unwrap_or_default();

        let inflight = runs.inflight(thread_id);
        if prevent_insert_in_inflight && !inflight.is_empty() {
            return Ok(RunInsert {
                run: None,
                inflight,
            });
        }

        let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);
        let mut config = assistant
            .config
            .merged_with(&thread_config)
            .merged_with(&request.config);
        // Synthesized identifiers override whatever the layers carried.
        config
            .configurable
            .insert("run_id".to_string(), json!(run_id));
        config
            .configurable
            .insert("thread_id".to_string(), json!(thread_id));
        config
            .configurable
            .insert("graph_id".to_string(), json!(assistant.graph_id));
        config
            .configurable
            .insert("assistant_id".to_string(), json!(assistant.assistant_id));
        config
            .configurable
            .entry("user_id".to_string())
            .or_insert(Value::Null);

        let now = Utc::now();
        let scheduled_at = match request.after_seconds {
            Some(seconds) => now + chrono::Duration::seconds(seconds as i64),
            None => now,
        };
        let run = Run {
            run_id,
            thread_id,
            assistant_id: assistant.assistant_id,
            status: RunStatus::Pending,
            kwargs: RunKwargs {
                input: request.input,
                command: request.command,
                stream_mode: request.stream_mode,
                interrupt_before: request.interrupt_before,
                interrupt_after: request.interrupt_after,
                config,
                subgraphs: false,
            },
            multitask_strategy: request.multitask_strategy,
            metadata: request.metadata,
            created_at: scheduled_at,
            updated_at: now,
        };
        runs.runs.insert(run_id, run.clone());
        drop(runs);
        drop(threads);

        self.wake.notify_one();
        Ok(RunInsert {
            run: Some(run),
            inflight,
        })
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        thread_id: Option<Uuid>,
    ) -> Result<Run, RuntimeError> {
        let shard = self.state.runs().await;
        let run = shard
            .runs
            .get(&run_id)
            .filter(|run| thread_id.map(|tid| run.thread_id == tid).unwrap_or(true))
            .cloned()
            .ok_or_else(|| RuntimeError::not_found("run", run_id))?;
        Ok(run)
    }

    pub async fn search(
        &self,
        thread_id: Uuid,
        query: RunSearch,
    ) -> Result<Vec<Run>, RuntimeError> {
        let shard = self.state.runs().await;
        let mut matches: Vec<Run> = shard
            .runs
            .values()
            .filter(|run| run.thread_id == thread_id)
            .filter(|run| match query.status {
                Some(status) => run.status == status,
                None => true,
            })
            .filter(|run| match &query.metadata {
                Some(filter) => map_contains_subset(&run.metadata, filter),
                None => true,
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(10);
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn set_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<Run, RuntimeError> {
        let mut shard = self.state.runs_mut().await;
        let run = shard
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| RuntimeError::not_found("run", run_id))?;
        run.set_status(status);
        Ok(run.clone())
    }

    /// Put a run back on the schedule (transient-failure retry).
    pub(crate) async fn reschedule(
        &self,
        run_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RuntimeError> {
        let mut shard = self.state.runs_mut().await;
        let run = shard
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| RuntimeError::not_found("run", run_id))?;
        run.status = RunStatus::Pending;
        run.created_at = at;
        run.updated_at = Utc::now();
        Ok(())
    }

    /// Cancel runs on a thread.
    ///
    /// Fires each run's cancellation handle when present. A pending run
    /// becomes `interrupted`, except under `rollback` when it was never
    /// started (no handle): then it is deleted outright. Finished runs are
    /// left alone with a warning.
    pub async fn cancel(
        &self,
        thread_id: Option<Uuid>,
        run_ids: &[Uuid],
        action: CancelAction,
    ) -> Result<(), RuntimeError> {
        let mut found = 0usize;
        let mut shard = self.state.runs_mut().await;
        for &run_id in run_ids {
            let Some(run) = shard.runs.get(&run_id) else {
                continue;
            };
            if let Some(expected) = thread_id {
                if run.thread_id != expected {
                    continue;
                }
            }
            found += 1;
            let status = run.status;

            let control = self.bus.control(run_id);
            if let Some(control) = &control {
                control.fire(action);
            }

            if status != RunStatus::Pending {
                tracing::warn!(run_id = %run_id, status = ?status, "cannot cancel a finished run");
                continue;
            }
            if control.is_some() || action != CancelAction::Rollback {
                if let Some(run) = shard.runs.get_mut(&run_id) {
                    run.set_status(RunStatus::Interrupted);
                }
            } else {
                // Rollback of a run that never started: no trace remains.
                shard.forget(run_id);
                self.bus.drop_queue(run_id);
            }
        }
        drop(shard);

        if found < run_ids.len() {
            return Err(RuntimeError::NotFound(format!(
                "{} of {} runs not found on thread",
                run_ids.len() - found,
                run_ids.len()
            )));
        }
        Ok(())
    }

    /// Delete a run, its queue, and the checkpoints it produced.
    pub async fn delete(
        &self,
        run_id: Uuid,
        thread_id: Option<Uuid>,
    ) -> Result<(), RuntimeError> {
        let run = self.get(run_id, thread_id).await?;
        if let Some(control) = self.bus.control(run_id) {
            control.fire(CancelAction::Interrupt);
        }

        let tuples = self
            .checkpointer
            .list(
                &graphd_core::checkpoint::CheckpointRef::latest(run.thread_id),
                None,
                None,
            )
            .await?;
        for tuple in tuples {
            let written_by_run = tuple
                .metadata
                .get("run_id")
                .and_then(Value::as_str)
                .map(|id| id == run_id.to_string())
                .unwrap_or(false);
            if written_by_run {
                self.checkpointer.delete(&tuple.config).await?;
            }
        }

        let mut shard = self.state.runs_mut().await;
        shard.forget(run_id);
        drop(shard);
        self.bus.drop_queue(run_id);
        Ok(())
    }

    /// Subscribe to a run's output. Yields messages (the `control:done`
    /// sentinel included, as the final item) until the run finishes, the run
    /// stops being active, or the subscriber disconnects.
    pub fn join_stream(
        &self,
        run_id: Uuid,
        thread_id: Option<Uuid>,
        options: JoinOptions,
    ) -> impl Stream<Item = StreamMessage> + Send + 'static {
        let runs = self.clone();
        stream! {
            let queue = runs.bus.queue(run_id);
            loop {
                match queue.recv(JOIN_POLL_INTERVAL, &options.disconnect).await {
                    Ok(message) => {
                        let done = message.is_done();
                        yield message;
                        if done {
                            break;
                        }
                    }
                    Err(BusError::Timeout) => {
                        // No message this cycle: keep waiting only while the
                        // run can still produce output.
                        match runs.get(run_id, thread_id).await {
                            Ok(run) if run.status.is_active() => continue,
                            _ => break,
                        }
                    }
                    Err(BusError::Cancelled) => {
                        if options.cancel_on_disconnect {
                            if let Some(thread_id) = thread_id {
                                if let Err(err) = runs
                                    .cancel(Some(thread_id), &[run_id], CancelAction::Interrupt)
                                    .await
                                {
                                    tracing::warn!(
                                        run_id = %run_id,
                                        error = %err,
                                        "cancel on disconnect failed"
                                    );
                                }
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Drain the join stream and keep the final value: the last `values`
    /// event, with `error` events rewritten to `{"__error__": ...}`.
    pub async fn wait(
        &self,
        run_id: Uuid,
        thread_id: Option<Uuid>,
    ) -> Result<Option<Value>, RuntimeError> {
        let stream = self.join_stream(run_id, thread_id, JoinOptions::default());
        pin_mut!(stream);
        let mut last: Option<Value> = None;
        while let Some(message) = stream.next().await {
            match message.event_name() {
                "values" => last = Some(message.data),
                "error" => last = Some(json!({ "__error__": message.data })),
                _ => {}
            }
        }
        Ok(last)
    }

    /// Wait for a run's final value, falling back to the thread's current
    /// values when the stream yielded nothing.
    pub async fn join(&self, run_id: Uuid, thread_id: Uuid) -> Result<Value, RuntimeError> {
        self.threads.get(thread_id).await?;
        match self.wait(run_id, Some(thread_id)).await? {
            Some(value) => Ok(value),
            None => {
                let thread = self.threads.get(thread_id).await?;
                Ok(thread.values.unwrap_or(Value::Null))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphd_core::graph::GraphRegistry;
    use graphd_core::mock::{MockGraph, MockGraphFactory};
    use graphd_core::types::Assistant;
    use graphd_stores::InMemoryKvStore;
    use serde_json::json;

    struct Fixture {
        runs: Runs,
        threads: Threads,
        state: Arc<StateStore>,
        bus: Arc<StreamBus>,
        assistant: Assistant,
    }

    async fn fixture() -> Fixture {
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
        let graphs = Arc::new(graphs);
        let threads = Threads::new(
            Arc::clone(&state),
            Arc::clone(&bus),
            checkpointer.clone(),
            Arc::clone(&graphs),
            Arc::new(InMemoryKvStore::new()),
        );
        let runs = Runs::new(
            Arc::clone(&state),
            Arc::clone(&bus),
            checkpointer,
            threads.clone(),
            Arc::new(Notify::new()),
        );

        let assistant_config: RunConfig = serde_json::from_value(json!({
            "configurable": {"model": "default", "depth": 1}
        }))
        .unwrap();
        let assistant = Assistant::new(
            Uuid::new_v4(),
            "agent",
            assistant_config,
            JsonMap::new(),
            None,
        );
        state
            .assistants_mut()
            .await
            .assistants
            .insert(assistant.assistant_id, assistant.clone());

        Fixture {
            runs,
            threads,
            state,
            bus,
            assistant,
        }
    }

    #[test]
    fn test_put_unknown_assistant_is_not_found() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let err = fx
                .runs
                .put(
                    Uuid::new_v4(),
                    RunCreate::for_assistant(Uuid::new_v4(), json!({})),
                    false,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::NotFound(_)));
        });
    }

    #[test]
    fn test_put_rejects_missing_thread_by_default() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let err = fx
                .runs
                .put(
                    Uuid::new_v4(),
                    RunCreate::for_assistant(fx.assistant.assistant_id, json!({})),
                    false,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::NotFound(_)));
        });
    }

    #[test]
    fn test_put_creates_thread_seeded_from_assistant() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request =
                RunCreate::for_assistant(fx.assistant.assistant_id, json!({"x": 1}));
            request.if_not_exists = IfNotExists::Create;
            let insert = fx.runs.put(thread_id, request, false).await.unwrap();
            let run = insert.run.unwrap();
            assert!(insert.inflight.is_empty());

            let thread = fx.threads.get(thread_id).await.unwrap();
            assert_eq!(thread.status, ThreadStatus::Busy);
            assert_eq!(thread.metadata.get("graph_id"), Some(&json!("agent")));
            assert_eq!(
                thread.metadata.get("assistant_id"),
                Some(&json!(fx.assistant.assistant_id))
            );

            let configurable = &run.kwargs.config.configurable;
            assert_eq!(configurable.get("run_id"), Some(&json!(run.run_id)));
            assert_eq!(configurable.get("thread_id"), Some(&json!(thread_id)));
            assert_eq!(configurable.get("graph_id"), Some(&json!("agent")));
            assert_eq!(configurable.get("model"), Some(&json!("default")));
        });
    }

    #[test]
    fn test_user_config_overrides_assistant_layer() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request =
                RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            request.config =
                serde_json::from_value(json!({"configurable": {"model": "override"}})).unwrap();
            let run = fx
                .runs
                .put(thread_id, request, false)
                .await
                .unwrap()
                .run
                .unwrap();
            assert_eq!(
                run.kwargs.config.configurable.get("model"),
                Some(&json!("override"))
            );
            // Untouched assistant keys survive the merge.
            assert_eq!(run.kwargs.config.configurable.get("depth"), Some(&json!(1)));
        });
    }

    #[test]
    fn test_prevent_insert_returns_inflight_unchanged() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut first = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            first.if_not_exists = IfNotExists::Create;
            let first_run = fx
                .runs
                .put(thread_id, first, false)
                .await
                .unwrap()
                .run
                .unwrap();

            let second = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            let insert = fx.runs.put(thread_id, second, true).await.unwrap();
            assert!(insert.run.is_none());
            assert_eq!(insert.inflight.len(), 1);
            assert_eq!(insert.inflight[0].run_id, first_run.run_id);
        });
    }

    #[test]
    fn test_multitask_reject_conflicts_on_busy_thread() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut first = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            first.if_not_exists = IfNotExists::Create;
            fx.runs.create(thread_id, first).await.unwrap();

            let second = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            let err = fx.runs.create(thread_id, second).await.unwrap_err();
            assert!(matches!(err, RuntimeError::Conflict(_)));

            let pending = fx
                .runs
                .search(
                    thread_id,
                    RunSearch {
                        status: Some(RunStatus::Pending),
                        ..RunSearch::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(pending.len(), 1);
        });
    }

    #[test]
    fn test_multitask_enqueue_keeps_both_pending() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut first = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            first.if_not_exists = IfNotExists::Create;
            fx.runs.create(thread_id, first).await.unwrap();

            let mut second = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            second.multitask_strategy = MultitaskStrategy::Enqueue;
            fx.runs.create(thread_id, second).await.unwrap();

            let pending = fx
                .runs
                .search(
                    thread_id,
                    RunSearch {
                        status: Some(RunStatus::Pending),
                        ..RunSearch::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(pending.len(), 2);
        });
    }

    #[test]
    fn test_multitask_rollback_deletes_unstarted_run() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut first = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            first.if_not_exists = IfNotExists::Create;
            let first_run = fx.runs.create(thread_id, first).await.unwrap();

            let mut second = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            second.multitask_strategy = MultitaskStrategy::Rollback;
            let second_run = fx.runs.create(thread_id, second).await.unwrap();

            // R1 never started (no control handle): deleted without a trace.
            assert!(matches!(
                fx.runs.get(first_run.run_id, Some(thread_id)).await,
                Err(RuntimeError::NotFound(_))
            ));
            let survivor = fx
                .runs
                .get(second_run.run_id, Some(thread_id))
                .await
                .unwrap();
            assert_eq!(survivor.status, RunStatus::Pending);
        });
    }

    #[test]
    fn test_multitask_interrupt_marks_unstarted_run_interrupted() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut first = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            first.if_not_exists = IfNotExists::Create;
            let first_run = fx.runs.create(thread_id, first).await.unwrap();

            let mut second = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            second.multitask_strategy = MultitaskStrategy::Interrupt;
            fx.runs.create(thread_id, second).await.unwrap();

            let interrupted = fx
                .runs
                .get(first_run.run_id, Some(thread_id))
                .await
                .unwrap();
            assert_eq!(interrupted.status, RunStatus::Interrupted);
        });
    }

    #[test]
    fn test_cancel_fires_control_of_locked_run() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            let run = fx.runs.create(thread_id, request).await.unwrap();

            let control = fx.bus.lock(run.run_id);
            fx.runs
                .cancel(Some(thread_id), &[run.run_id], CancelAction::Rollback)
                .await
                .unwrap();

            assert!(control.is_cancelled());
            assert_eq!(control.action(), CancelAction::Rollback);
            // Locked pending run is interrupted, not deleted: the executor
            // owns the rollback cleanup.
            let cancelled = fx.runs.get(run.run_id, Some(thread_id)).await.unwrap();
            assert_eq!(cancelled.status, RunStatus::Interrupted);
        });
    }

    #[test]
    fn test_cancel_is_idempotent_and_counts_missing_runs() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            let run = fx.runs.create(thread_id, request).await.unwrap();

            fx.runs
                .cancel(Some(thread_id), &[run.run_id], CancelAction::Interrupt)
                .await
                .unwrap();
            let first = fx.runs.get(run.run_id, Some(thread_id)).await.unwrap();
            assert_eq!(first.status, RunStatus::Interrupted);
            let stamp = first.updated_at;

            // Second cancel is a warning-only no-op.
            fx.runs
                .cancel(Some(thread_id), &[run.run_id], CancelAction::Interrupt)
                .await
                .unwrap();
            let second = fx.runs.get(run.run_id, Some(thread_id)).await.unwrap();
            assert_eq!(second.status, RunStatus::Interrupted);
            assert_eq!(second.updated_at, stamp);

            let err = fx
                .runs
                .cancel(
                    Some(thread_id),
                    &[run.run_id, Uuid::new_v4()],
                    CancelAction::Interrupt,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::NotFound(_)));
        });
    }

    #[test]
    fn test_after_seconds_schedules_in_the_future() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            request.after_seconds = Some(3600);
            let run = fx.runs.create(thread_id, request).await.unwrap();
            assert!(run.created_at > Utc::now() + chrono::Duration::minutes(30));
            assert!(!run.is_due(Utc::now()));
        });
    }

    #[test]
    fn test_get_checks_thread_ownership() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            let run = fx.runs.create(thread_id, request).await.unwrap();

            assert!(fx.runs.get(run.run_id, Some(thread_id)).await.is_ok());
            assert!(matches!(
                fx.runs.get(run.run_id, Some(Uuid::new_v4())).await,
                Err(RuntimeError::NotFound(_))
            ));
        });
    }

    #[test]
    fn test_delete_forgets_run_and_retry_counter() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            let run = fx.runs.create(thread_id, request).await.unwrap();
            fx.state.runs_mut().await.bump_attempt(run.run_id);

            fx.runs.delete(run.run_id, Some(thread_id)).await.unwrap();
            assert!(matches!(
                fx.runs.get(run.run_id, None).await,
                Err(RuntimeError::NotFound(_))
            ));
            assert!(fx.state.runs().await.retry_counter.is_empty());
        });
    }

    #[test]
    fn test_join_stream_ends_after_done_sentinel() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            let run = fx.runs.create(thread_id, request).await.unwrap();

            fx.bus.publish(
                run.run_id,
                StreamMessage::stream(run.run_id, "values", json!({"x": 1})),
            );
            fx.bus.publish(run.run_id, StreamMessage::done(run.run_id));

            let stream =
                fx.runs
                    .join_stream(run.run_id, Some(thread_id), JoinOptions::default());
            let collected: Vec<StreamMessage> = stream.collect().await;
            assert_eq!(collected.len(), 2);
            assert_eq!(collected[0].event_name(), "values");
            assert!(collected[1].is_done());
        });
    }

    #[test]
    fn test_wait_keeps_last_values_and_rewrites_errors() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            let run = fx.runs.create(thread_id, request).await.unwrap();

            fx.bus.publish(
                run.run_id,
                StreamMessage::stream(run.run_id, "values", json!({"x": 1})),
            );
            fx.bus.publish(
                run.run_id,
                StreamMessage::stream(run.run_id, "error", json!("boom")),
            );
            fx.bus.publish(run.run_id, StreamMessage::done(run.run_id));

            let value = fx.runs.wait(run.run_id, Some(thread_id)).await.unwrap();
            assert_eq!(value, Some(json!({"__error__": "boom"})));
        });
    }

    #[test]
    fn test_disconnect_with_cancel_interrupts_run() {
        tokio_test::block_on(async {
            let fx = fixture().await;
            let thread_id = Uuid::new_v4();
            let mut request = RunCreate::for_assistant(fx.assistant.assistant_id, json!({}));
            request.if_not_exists = IfNotExists::Create;
            let run = fx.runs.create(thread_id, request).await.unwrap();

            let disconnect = CancellationToken::new();
            let options = JoinOptions {
                disconnect: disconnect.clone(),
                cancel_on_disconnect: true,
            };
            let stream = fx.runs.join_stream(run.run_id, Some(thread_id), options);
            let collector = tokio::spawn(async move {
                let collected: Vec<StreamMessage> = stream.collect().await;
                collected
            });
            tokio::task::yield_now().await;
            disconnect.cancel();
            let collected = collector.await.unwrap();
            assert!(collected.is_empty());

            let cancelled = fx.runs.get(run.run_id, Some(thread_id)).await.unwrap();
            assert_eq!(cancelled.status, RunStatus::Interrupted);
        });
    }
}
