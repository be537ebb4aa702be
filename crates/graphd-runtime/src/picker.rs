//! Pending-run picker.
//!
//! Collects due pending runs in FIFO order of scheduled time, locks each one
//! in the Stream Bus, and bumps its retry counter. The executor loop drains
//! batches; a `Notify` poked on run creation keeps latency low between ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;

use graphd_core::types::Run;
use graphd_stores::{RunControl, StateStore, StreamBus};

/// One unit of work handed to the executor.
pub struct ScheduledRun {
    pub run: Run,
    /// How many times this run has been handed out, this hand-out included.
    pub attempt: u32,
    pub control: Arc<RunControl>,
}

pub struct Picker {
    state: Arc<StateStore>,
    bus: Arc<StreamBus>,
    wake: Arc<Notify>,
}

impl Picker {
    pub fn new(state: Arc<StateStore>, bus: Arc<StreamBus>, wake: Arc<Notify>) -> Self {
        Self { state, bus, wake }
    }

    /// Collect every due pending run that is not already locked, oldest
    /// first (ties broken by run id). Each picked run is locked in the bus
    /// and its retry counter incremented before it is returned.
    pub async fn next_batch(&self) -> Vec<ScheduledRun> {
        let mut shard = self.state.runs_mut().await;
        let now = Utc::now();
        let mut due: Vec<Run> = shard
            .runs
            .values()
            .filter(|run| run.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.run_id.cmp(&b.run_id))
        });

        let mut batch = Vec::new();
        for run in due {
            if self.bus.is_locked(run.run_id) {
                continue;
            }
            let control = self.bus.lock(run.run_id);
            let attempt = shard.bump_attempt(run.run_id);
            tracing::debug!(run_id = %run.run_id, attempt, "picked pending run");
            batch.push(ScheduledRun {
                run,
                attempt,
                control,
            });
        }
        batch
    }

    /// Sleep until poked by a run insert or until the tick elapses,
    /// whichever comes first.
    pub async fn idle(&self, tick: Duration) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use graphd_core::types::{JsonMap, MultitaskStrategy, RunKwargs, RunStatus};
    use uuid::Uuid;

    fn picker() -> (Picker, Arc<StateStore>, Arc<StreamBus>) {
        let state = Arc::new(StateStore::in_memory());
        let bus = Arc::new(StreamBus::new());
        (
            Picker::new(Arc::clone(&state), Arc::clone(&bus), Arc::new(Notify::new())),
            state,
            bus,
        )
    }

    async fn insert_run(
        state: &StateStore,
        status: RunStatus,
        offset_secs: i64,
    ) -> Uuid {
        let now = Utc::now();
        let run = Run {
            run_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            assistant_id: Uuid::new_v4(),
            status,
            kwargs: RunKwargs::default(),
            multitask_strategy: MultitaskStrategy::default(),
            metadata: JsonMap::new(),
            created_at: now + ChronoDuration::seconds(offset_secs),
            updated_at: now,
        };
        let run_id = run.run_id;
        state.runs_mut().await.runs.insert(run_id, run);
        run_id
    }

    #[test]
    fn test_batch_is_fifo_by_scheduled_time() {
        tokio_test::block_on(async {
            let (picker, state, _) = picker();
            let late = insert_run(&state, RunStatus::Pending, -1).await;
            let early = insert_run(&state, RunStatus::Pending, -10).await;

            let batch = picker.next_batch().await;
            assert_eq!(batch.len(), 2);
            assert_eq!(batch[0].run.run_id, early);
            assert_eq!(batch[1].run.run_id, late);
            assert_eq!(batch[0].attempt, 1);
        });
    }

    #[test]
    fn test_batch_skips_future_and_non_pending_runs() {
        tokio_test::block_on(async {
            let (picker, state, _) = picker();
            insert_run(&state, RunStatus::Pending, 3600).await;
            insert_run(&state, RunStatus::Running, -1).await;
            insert_run(&state, RunStatus::Success, -1).await;

            assert!(picker.next_batch().await.is_empty());
        });
    }

    #[test]
    fn test_batch_skips_already_locked_runs() {
        tokio_test::block_on(async {
            let (picker, state, bus) = picker();
            let locked = insert_run(&state, RunStatus::Pending, -5).await;
            let free = insert_run(&state, RunStatus::Pending, -1).await;
            bus.lock(locked);

            let batch = picker.next_batch().await;
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].run.run_id, free);
        });
    }

    #[test]
    fn test_repeated_pickup_increments_attempt() {
        tokio_test::block_on(async {
            let (picker, state, bus) = picker();
            let run_id = insert_run(&state, RunStatus::Pending, -1).await;

            let first = picker.next_batch().await;
            assert_eq!(first[0].attempt, 1);

            // Executor gave the run back (transient retry) and unlocked it.
            bus.unlock(run_id);
            let second = picker.next_batch().await;
            assert_eq!(second[0].attempt, 2);
        });
    }
}
