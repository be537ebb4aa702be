//! Sharded control-plane state with a single aggregate document on disk.
//!
//! In memory the state is split per aggregate kind (assistants, threads,
//! runs) behind independent `tokio::sync::RwLock`s so run-status updates do
//! not block thread reads; a guard held across `.await` keeps each shard's
//! mutations atomic. On disk everything still lands in one JSON document,
//! written by a background flusher when dirty and once more on shutdown.
//!
//! Lock order when an operation needs more than one shard:
//! assistants -> threads -> runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use graphd_core::store::StoreError;
use graphd_core::types::{Assistant, AssistantVersion, Run, RunStatus, Thread};

const MAX_CONSECUTIVE_FLUSH_FAILURES: u32 = 3;

/// Assistants plus their immutable version records.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AssistantShard {
    #[serde(default)]
    pub assistants: HashMap<Uuid, Assistant>,
    #[serde(default)]
    pub versions: Vec<AssistantVersion>,
}

impl AssistantShard {
    /// Versions of one assistant, newest first.
    pub fn versions_of(&self, assistant_id: Uuid) -> Vec<&AssistantVersion> {
        let mut versions: Vec<&AssistantVersion> = self
            .versions
            .iter()
            .filter(|version| version.assistant_id == assistant_id)
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        versions
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ThreadShard {
    #[serde(default)]
    pub threads: HashMap<Uuid, Thread>,
}

/// Runs plus the per-run retry counter maintained by the picker.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RunShard {
    #[serde(default)]
    pub runs: HashMap<Uuid, Run>,
    #[serde(default)]
    pub retry_counter: HashMap<Uuid, u32>,
}

impl RunShard {
    /// Pending runs on a thread, FIFO by scheduled time.
    pub fn inflight(&self, thread_id: Uuid) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .values()
            .filter(|run| run.thread_id == thread_id && run.status == RunStatus::Pending)
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.run_id.cmp(&b.run_id))
        });
        runs
    }

    pub fn has_pending(&self, thread_id: Uuid) -> bool {
        self.runs
            .values()
            .any(|run| run.thread_id == thread_id && run.status == RunStatus::Pending)
    }

    /// Increment and return the attempt counter for a run.
    pub fn bump_attempt(&mut self, run_id: Uuid) -> u32 {
        let attempt = self.retry_counter.entry(run_id).or_insert(0);
        *attempt += 1;
        *attempt
    }

    pub fn forget(&mut self, run_id: Uuid) {
        self.runs.remove(&run_id);
        self.retry_counter.remove(&run_id);
    }
}

/// Serialized shape of the whole control plane.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub assistants: AssistantShard,
    #[serde(default)]
    pub threads: ThreadShard,
    #[serde(default)]
    pub runs: RunShard,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<chrono::DateTime<Utc>>,
}

/// Shared control-plane state store.
pub struct StateStore {
    assistants: RwLock<AssistantShard>,
    threads: RwLock<ThreadShard>,
    runs: RwLock<RunShard>,
    dirty: AtomicBool,
    path: Option<PathBuf>,
}

impl StateStore {
    /// Volatile store for tests and ephemeral servers.
    pub fn in_memory() -> Self {
        Self::from_document(StateDocument::default(), None)
    }

    /// Load from `path`, or start empty when the file does not exist yet.
    /// A present-but-unreadable document is a startup error.
    pub fn load(path: PathBuf) -> Result<Self, StoreError> {
        let document = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StateDocument::default(),
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };
        Ok(Self::from_document(document, Some(path)))
    }

    fn from_document(document: StateDocument, path: Option<PathBuf>) -> Self {
        Self {
            assistants: RwLock::new(document.assistants),
            threads: RwLock::new(document.threads),
            runs: RwLock::new(document.runs),
            dirty: AtomicBool::new(false),
            path,
        }
    }

    pub async fn assistants(&self) -> RwLockReadGuard<'_, AssistantShard> {
        self.assistants.read().await
    }

    /// Write access marks the document dirty up front.
    pub async fn assistants_mut(&self) -> RwLockWriteGuard<'_, AssistantShard> {
        self.mark_dirty();
        self.assistants.write().await
    }

    pub async fn threads(&self) -> RwLockReadGuard<'_, ThreadShard> {
        self.threads.read().await
    }

    pub async fn threads_mut(&self) -> RwLockWriteGuard<'_, ThreadShard> {
        self.mark_dirty();
        self.threads.write().await
    }

    pub async fn runs(&self) -> RwLockReadGuard<'_, RunShard> {
        self.runs.read().await
    }

    pub async fn runs_mut(&self) -> RwLockWriteGuard<'_, RunShard> {
        self.mark_dirty();
        self.runs.write().await
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the aggregate document when dirty. Returns whether a write
    /// happened. On failure the dirty flag is restored so the next tick
    /// retries.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let Some(path) = &self.path else {
            self.dirty.store(false, Ordering::Release);
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let document = {
            let assistants = self.assistants.read().await;
            let threads = self.threads.read().await;
            let runs = self.runs.read().await;
            StateDocument {
                assistants: assistants.clone(),
                threads: threads.clone(),
                runs: runs.clone(),
                saved_at: Some(Utc::now()),
            }
        };

        match write_document(path, &document) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.mark_dirty();
                Err(err)
            }
        }
    }

    /// Spawn the background flusher. It writes every `interval` when dirty
    /// and performs a final flush when `shutdown` fires.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_failures = 0u32;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Err(err) = store.flush().await {
                            tracing::error!(error = %err, "final state flush failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        match store.flush().await {
                            Ok(_) => consecutive_failures = 0,
                            Err(err) => {
                                consecutive_failures += 1;
                                if consecutive_failures >= MAX_CONSECUTIVE_FLUSH_FAILURES {
                                    tracing::error!(
                                        error = %err,
                                        failures = consecutive_failures,
                                        "state flush failing persistently"
                                    );
                                } else {
                                    tracing::warn!(error = %err, "state flush failed; will retry");
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

fn write_document(path: &PathBuf, document: &StateDocument) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(document)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
