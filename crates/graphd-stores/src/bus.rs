//! Stream Bus - per-run message queues and cancellation handles.
//!
//! Every run gets a FIFO queue connecting executor output to subscribers and
//! at most one `RunControl` while it is locked by the picker. Queues are
//! work-queues: with several subscribers each message goes to whichever
//! dequeues first; the server attaches one primary subscriber per run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use graphd_core::types::CancelAction;

/// Expected stream-side outcomes; not logged as errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("stream receive timed out")]
    Timeout,
    #[error("stream receive cancelled")]
    Cancelled,
}

/// One message on a run's queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub topic: String,
    pub data: Value,
}

impl StreamMessage {
    /// Payload event under `run:<run_id>:stream:<subtopic>`.
    pub fn stream(run_id: Uuid, subtopic: &str, data: Value) -> Self {
        Self {
            topic: format!("run:{run_id}:stream:{subtopic}"),
            data,
        }
    }

    /// In-band control event under `run:<run_id>:control`.
    pub fn control(run_id: Uuid, data: Value) -> Self {
        Self {
            topic: format!("run:{run_id}:control"),
            data,
        }
    }

    /// The sentinel that terminates a subscriber.
    pub fn done(run_id: Uuid) -> Self {
        Self::control(run_id, json!("done"))
    }

    pub fn is_control(&self) -> bool {
        self.topic.ends_with(":control")
    }

    pub fn is_done(&self) -> bool {
        self.is_control() && self.data == json!("done")
    }

    /// Short event name: the subtopic for payload events, `control` for
    /// control events. This is what SSE frames carry as `event:`.
    pub fn event_name(&self) -> &str {
        if self.is_control() {
            return "control";
        }
        self.topic
            .split(":stream:")
            .nth(1)
            .unwrap_or(self.topic.as_str())
    }
}

/// FIFO queue of stream messages for one run.
#[derive(Default)]
pub struct RunQueue {
    inner: Mutex<VecDeque<StreamMessage>>,
    notify: Notify,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and wake one waiter.
    pub fn push(&self, message: StreamMessage) {
        self.inner
            .lock()
            .expect("run queue poisoned")
            .push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StreamMessage> {
        self.inner.lock().expect("run queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("run queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dequeue the next message, waiting up to `wait`. Waiters deregister on
    /// drop, so timing out or cancelling leaks nothing.
    pub async fn recv(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<StreamMessage, BusError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking so a concurrent push between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(message) = self.pop() {
                return Ok(message);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(BusError::Timeout),
                _ = cancel.cancelled() => return Err(BusError::Cancelled),
            }
        }
    }
}

/// Cancellation handle for one locked run: a pure cancellation token plus a
/// write-once reason read by the executor on completion.
#[derive(Default)]
pub struct RunControl {
    token: CancellationToken,
    action: OnceLock<CancelAction>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the reason (first write wins) and fire the token.
    pub fn fire(&self, action: CancelAction) {
        let _ = self.action.set(action);
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason set by the first `fire`; `Interrupt` when fired without one.
    pub fn action(&self) -> CancelAction {
        self.action.get().copied().unwrap_or_default()
    }
}

/// Registry of per-run queues and cancellation handles.
#[derive(Default)]
pub struct StreamBus {
    controls: RwLock<HashMap<Uuid, Arc<RunControl>>>,
    queues: RwLock<HashMap<Uuid, Arc<RunQueue>>>,
}

impl StreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a run: create its cancellation handle. An existing handle is a
    /// bookkeeping bug upstream; it is logged and overwritten.
    pub fn lock(&self, run_id: Uuid) -> Arc<RunControl> {
        let control = Arc::new(RunControl::new());
        let previous = self
            .controls
            .write()
            .expect("bus controls poisoned")
            .insert(run_id, Arc::clone(&control));
        if previous.is_some() {
            tracing::warn!(run_id = %run_id, "run already locked; overwriting control handle");
        }
        control
    }

    pub fn unlock(&self, run_id: Uuid) {
        self.controls
            .write()
            .expect("bus controls poisoned")
            .remove(&run_id);
    }

    pub fn is_locked(&self, run_id: Uuid) -> bool {
        self.controls
            .read()
            .expect("bus controls poisoned")
            .contains_key(&run_id)
    }

    pub fn control(&self, run_id: Uuid) -> Option<Arc<RunControl>> {
        self.controls
            .read()
            .expect("bus controls poisoned")
            .get(&run_id)
            .cloned()
    }

    /// Queue for a run, created on first access.
    pub fn queue(&self, run_id: Uuid) -> Arc<RunQueue> {
        if let Some(queue) = self
            .queues
            .read()
            .expect("bus queues poisoned")
            .get(&run_id)
        {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write().expect("bus queues poisoned");
        Arc::clone(queues.entry(run_id).or_default())
    }

    pub fn drop_queue(&self, run_id: Uuid) {
        self.queues
            .write()
            .expect("bus queues poisoned")
            .remove(&run_id);
    }

    /// Push onto a run's queue, creating it if needed.
    pub fn publish(&self, run_id: Uuid, message: StreamMessage) {
        self.queue(run_id).push(message);
    }
}
