//! Run executor.
//!
//! Consumes scheduled runs from the picker, drives the graph stream under
//! the run's cancellation token, fans chunks out on the Stream Bus, and
//! settles run and thread status when the invocation ends.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use graphd_core::checkpoint::CheckpointRef;
use graphd_core::graph::{Graph, GraphError, GraphInput};
use graphd_core::types::{CancelAction, Run, RunStatus};
use graphd_stores::{StreamBus, StreamMessage};

use crate::error::RuntimeError;
use crate::picker::{Picker, ScheduledRun};
use crate::runs::Runs;
use crate::threads::Threads;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent run executions. Pick-up order stays FIFO regardless.
    pub workers: usize,
    /// Hand-outs per run before a transient failure becomes permanent.
    pub max_attempts: u32,
    /// Budget for post-cancellation cleanup.
    pub grace_period: Duration,
    /// Picker poll interval when idle.
    pub tick: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_attempts: 3,
            grace_period: Duration::from_secs(30),
            tick: Duration::from_millis(500),
        }
    }
}

enum RunOutcome {
    Completed,
    Cancelled(CancelAction),
    Failed(GraphError),
}

pub struct Executor {
    bus: Arc<StreamBus>,
    threads: Threads,
    runs: Runs,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(bus: Arc<StreamBus>, threads: Threads, runs: Runs, config: ExecutorConfig) -> Self {
        Self {
            bus,
            threads,
            runs,
            config,
        }
    }

    /// Spawn the dispatch loop: drain picker batches, executing each run on
    /// a worker slot, until `shutdown` fires.
    pub fn spawn(
        self: Arc<Self>,
        picker: Picker,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(self.config.workers.max(1)));
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let batch = picker.next_batch().await;
                if batch.is_empty() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = picker.idle(self.config.tick) => {}
                    }
                    continue;
                }
                for scheduled in batch {
                    let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                        return;
                    };
                    let executor = Arc::clone(&self);
                    tokio::spawn(async move {
                        executor.execute(scheduled).await;
                        drop(permit);
                    });
                }
            }
        })
    }

    /// Execute one scheduled run to a settled state. Always unlocks the run
    /// in the bus before returning.
    pub async fn execute(&self, scheduled: ScheduledRun) {
        let ScheduledRun {
            run,
            attempt,
            control,
        } = scheduled;
        let run_id = run.run_id;
        let thread_id = run.thread_id;

        tracing::info!(run_id = %run_id, thread_id = %thread_id, attempt, "run starting");
        if let Err(err) = self.runs.set_status(run_id, RunStatus::Running).await {
            // Deleted between pick-up and start (rollback of an unstarted
            // run races here); nothing left to do.
            tracing::warn!(run_id = %run_id, error = %err, "run vanished before start");
            self.bus.unlock(run_id);
            return;
        }
        self.bus.publish(
            run_id,
            StreamMessage::stream(
                run_id,
                "metadata",
                json!({"run_id": run_id, "attempt": attempt}),
            ),
        );

        let graph = match self.build_graph(&run).await {
            Ok(graph) => graph,
            Err(err) => {
                self.settle_failure(&run, attempt, GraphError::Fatal(err.to_string()))
                    .await;
                self.bus.unlock(run_id);
                return;
            }
        };

        let outcome = self.drive(&run, graph.as_ref(), &control.token()).await;
        // A cancel that raced stream completion still counts as a cancel.
        let outcome = match outcome {
            RunOutcome::Completed if control.is_cancelled() => {
                RunOutcome::Cancelled(control.action())
            }
            RunOutcome::Cancelled(_) => RunOutcome::Cancelled(control.action()),
            other => other,
        };

        match outcome {
            RunOutcome::Completed => self.settle_success(&run, graph.as_ref()).await,
            RunOutcome::Cancelled(CancelAction::Interrupt) => {
                self.settle_interrupt(&run, graph.as_ref()).await
            }
            RunOutcome::Cancelled(CancelAction::Rollback) => {
                self.settle_rollback(&run, graph.as_ref()).await
            }
            RunOutcome::Failed(err) => self.settle_failure(&run, attempt, err).await,
        }
        self.bus.unlock(run_id);
    }

    async fn build_graph(&self, run: &Run) -> Result<Arc<dyn Graph>, RuntimeError> {
        let graph_id = run
            .kwargs
            .config
            .configurable
            .get("graph_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RuntimeError::BadRequest(format!("run '{}' carries no graph_id", run.run_id))
            })?;
        self.threads.build_graph(graph_id).await
    }

    /// Drive the graph stream, publishing every chunk, until completion,
    /// failure, or cancellation.
    async fn drive(
        &self,
        run: &Run,
        graph: &dyn Graph,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let input = match (&run.kwargs.command, &run.kwargs.input) {
            (Some(command), _) => GraphInput::Command(command.clone()),
            (None, Some(input)) => GraphInput::Input(input.clone()),
            (None, None) => GraphInput::Input(Value::Null),
        };

        let mut stream = match graph
            .stream(input, &run.kwargs.config, &run.kwargs.stream_mode)
            .await
        {
            Ok(stream) => stream,
            Err(err) => return RunOutcome::Failed(err),
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RunOutcome::Cancelled(CancelAction::Interrupt);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        self.bus.publish(
                            run.run_id,
                            StreamMessage::stream(run.run_id, chunk.mode.as_str(), chunk.data),
                        );
                    }
                    Some(Err(err)) => return RunOutcome::Failed(err),
                    None => return RunOutcome::Completed,
                }
            }
        }
    }

    async fn settle_success(&self, run: &Run, graph: &dyn Graph) {
        if let Err(err) = self.refresh_thread(run, graph, None).await {
            tracing::error!(run_id = %run.run_id, error = %err, "thread refresh after success failed");
        }
        if let Err(err) = self.runs.set_status(run.run_id, RunStatus::Success).await {
            tracing::warn!(run_id = %run.run_id, error = %err, "run vanished before success");
        }
        self.bus.publish(run.run_id, StreamMessage::done(run.run_id));
        tracing::info!(run_id = %run.run_id, "run succeeded");
    }

    async fn settle_interrupt(&self, run: &Run, graph: &dyn Graph) {
        if let Err(err) = self.runs.set_status(run.run_id, RunStatus::Interrupted).await {
            tracing::warn!(run_id = %run.run_id, error = %err, "run vanished before interrupt");
        }
        let cleanup = self.refresh_thread(run, graph, None);
        match tokio::time::timeout(self.config.grace_period, cleanup).await {
            Ok(Err(err)) => {
                tracing::error!(run_id = %run.run_id, error = %err, "thread refresh after interrupt failed");
            }
            Err(_) => {
                tracing::error!(run_id = %run.run_id, "interrupt cleanup exceeded grace period");
            }
            Ok(Ok(())) => {}
        }
        self.bus.publish(run.run_id, StreamMessage::done(run.run_id));
        tracing::info!(run_id = %run.run_id, "run interrupted");
    }

    /// Rollback: the run's output is discarded, the run and its checkpoints
    /// deleted, and the thread settled on whatever checkpoint precedes them.
    async fn settle_rollback(&self, run: &Run, graph: &dyn Graph) {
        self.bus.publish(run.run_id, StreamMessage::done(run.run_id));
        let cleanup = async {
            self.runs.delete(run.run_id, Some(run.thread_id)).await?;
            self.refresh_thread(run, graph, None).await
        };
        match tokio::time::timeout(self.config.grace_period, cleanup).await {
            Ok(Err(err)) => {
                tracing::error!(run_id = %run.run_id, error = %err, "rollback cleanup failed");
            }
            Err(_) => {
                tracing::error!(run_id = %run.run_id, "rollback cleanup exceeded grace period");
            }
            Ok(Ok(())) => {}
        }
        tracing::info!(run_id = %run.run_id, "run rolled back");
    }

    async fn settle_failure(&self, run: &Run, attempt: u32, err: GraphError) {
        if err.is_transient() && attempt <= self.config.max_attempts {
            let delay = backoff_delay(run.run_id, attempt);
            tracing::warn!(
                run_id = %run.run_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure; rescheduling"
            );
            let at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            if let Err(err) = self.runs.reschedule(run.run_id, at).await {
                tracing::warn!(run_id = %run.run_id, error = %err, "reschedule failed");
            }
            return;
        }

        tracing::error!(run_id = %run.run_id, attempt, error = %err, "run failed");
        self.bus.publish(
            run.run_id,
            StreamMessage::stream(run.run_id, "error", json!(err.to_string())),
        );
        if let Err(err) = self.runs.set_status(run.run_id, RunStatus::Error).await {
            tracing::warn!(run_id = %run.run_id, error = %err, "run vanished before error");
        }
        let message = err.to_string();
        if let Err(err) = self
            .threads
            .set_status(run.thread_id, None, Some(&message))
            .await
        {
            tracing::error!(thread_id = %run.thread_id, error = %err, "thread error status failed");
        }
        self.bus.publish(run.run_id, StreamMessage::done(run.run_id));
    }

    /// Re-derive thread status from the latest checkpoint.
    async fn refresh_thread(
        &self,
        run: &Run,
        graph: &dyn Graph,
        error: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let snapshot = graph
            .get_state(&CheckpointRef::latest(run.thread_id), false)
            .await?;
        self.threads
            .set_status(run.thread_id, snapshot.as_ref(), error)
            .await?;
        Ok(())
    }
}

/// Exponential backoff with deterministic jitter (±25 %) derived from the
/// run id and attempt, so retry timing is reproducible.
fn backoff_delay(run_id: Uuid, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let base = BACKOFF_BASE_MS.saturating_mul(1 << shift).min(BACKOFF_MAX_MS);

    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let jitter_permille = (hasher.finish() % 501) as i64 - 250;

    let adjusted = base as i64 + (base as i64 * jitter_permille) / 1000;
    Duration::from_millis(adjusted.max(1) as u64)
}
