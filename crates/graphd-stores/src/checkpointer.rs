//! Checkpoint storage: in-memory backend and the delegating proxy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use graphd_core::checkpoint::{
    CheckpointRef, CheckpointTuple, Checkpointer, CheckpointerError,
};
use graphd_core::types::JsonMap;

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    id: String,
    payload: Value,
    metadata: JsonMap,
    parent: Option<String>,
    writes: Vec<(String, String, Value)>,
}

/// Volatile checkpoint storage for development and tests.
///
/// Checkpoint ids are zero-padded sequence numbers, so lexicographic order is
/// creation order.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: RwLock<HashMap<(Uuid, String), Vec<StoredCheckpoint>>>,
    seq: AtomicU64,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        format!("{:016x}", self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn key(config: &CheckpointRef) -> (Uuid, String) {
        (config.thread_id, config.checkpoint_ns.clone())
    }

    fn tuple_of(config_thread: Uuid, ns: &str, stored: &StoredCheckpoint) -> CheckpointTuple {
        CheckpointTuple {
            config: CheckpointRef {
                thread_id: config_thread,
                checkpoint_ns: ns.to_string(),
                checkpoint_id: Some(stored.id.clone()),
            },
            checkpoint: stored.payload.clone(),
            metadata: stored.metadata.clone(),
            parent: stored.parent.as_ref().map(|parent| CheckpointRef {
                thread_id: config_thread,
                checkpoint_ns: ns.to_string(),
                checkpoint_id: Some(parent.clone()),
            }),
            pending_writes: stored.writes.clone(),
        }
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn get_tuple(
        &self,
        config: &CheckpointRef,
    ) -> Result<Option<CheckpointTuple>, CheckpointerError> {
        let inner = self.inner.read().await;
        let Some(chain) = inner.get(&Self::key(config)) else {
            return Ok(None);
        };
        let stored = match &config.checkpoint_id {
            Some(id) => chain.iter().find(|stored| &stored.id == id),
            None => chain.last(),
        };
        Ok(stored.map(|stored| {
            Self::tuple_of(config.thread_id, &config.checkpoint_ns, stored)
        }))
    }

    async fn list(
        &self,
        config: &CheckpointRef,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<CheckpointTuple>, CheckpointerError> {
        let inner = self.inner.read().await;
        let Some(chain) = inner.get(&Self::key(config)) else {
            return Ok(Vec::new());
        };
        let mut tuples: Vec<CheckpointTuple> = chain
            .iter()
            .rev()
            .filter(|stored| match before {
                Some(boundary) => stored.id.as_str() < boundary,
                None => true,
            })
            .map(|stored| Self::tuple_of(config.thread_id, &config.checkpoint_ns, stored))
            .collect();
        if let Some(limit) = limit {
            tuples.truncate(limit);
        }
        Ok(tuples)
    }

    async fn put(
        &self,
        config: &CheckpointRef,
        checkpoint: Value,
        metadata: JsonMap,
    ) -> Result<CheckpointRef, CheckpointerError> {
        let mut inner = self.inner.write().await;
        let chain = inner.entry(Self::key(config)).or_default();
        let parent = chain.last().map(|stored| stored.id.clone());
        let id = self.next_id();
        chain.push(StoredCheckpoint {
            id: id.clone(),
            payload: checkpoint,
            metadata,
            parent,
            writes: Vec::new(),
        });
        Ok(CheckpointRef {
            thread_id: config.thread_id,
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(id),
        })
    }

    async fn put_writes(
        &self,
        config: &CheckpointRef,
        task_id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<(), CheckpointerError> {
        let mut inner = self.inner.write().await;
        let chain = inner
            .get_mut(&Self::key(config))
            .ok_or_else(|| CheckpointerError::NotFound(config.thread_id.to_string()))?;
        let stored = match &config.checkpoint_id {
            Some(id) => chain.iter_mut().find(|stored| &stored.id == id),
            None => chain.last_mut(),
        }
        .ok_or_else(|| CheckpointerError::NotFound(config.thread_id.to_string()))?;
        stored.writes.extend(
            writes
                .into_iter()
                .map(|(channel, value)| (task_id.to_string(), channel, value)),
        );
        Ok(())
    }

    async fn delete(&self, config: &CheckpointRef) -> Result<(), CheckpointerError> {
        let mut inner = self.inner.write().await;
        match &config.checkpoint_id {
            Some(id) => {
                if let Some(chain) = inner.get_mut(&Self::key(config)) {
                    chain.retain(|stored| &stored.id != id);
                }
            }
            None => {
                inner.retain(|(thread_id, _), _| *thread_id != config.thread_id);
            }
        }
        Ok(())
    }

    async fn copy(&self, from: Uuid, to: Uuid) -> Result<(), CheckpointerError> {
        let mut inner = self.inner.write().await;
        let copied: Vec<((Uuid, String), Vec<StoredCheckpoint>)> = inner
            .iter()
            .filter(|((thread_id, _), _)| *thread_id == from)
            .map(|((_, ns), chain)| ((to, ns.clone()), chain.clone()))
            .collect();
        for (key, chain) in copied {
            inner.insert(key, chain);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointerError> {
        self.inner.write().await.clear();
        Ok(())
    }
}

/// Thin facade in front of the injected checkpoint backend.
///
/// The control plane reaches checkpoint storage only through this type; the
/// payloads stay opaque.
#[derive(Clone)]
pub struct CheckpointerProxy {
    backend: Arc<dyn Checkpointer>,
}

impl CheckpointerProxy {
    pub fn new(backend: Arc<dyn Checkpointer>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointer::new()))
    }

    pub fn backend(&self) -> Arc<dyn Checkpointer> {
        Arc::clone(&self.backend)
    }

    /// Latest checkpoint of a thread's root namespace.
    pub async fn latest(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<CheckpointTuple>, CheckpointerError> {
        self.backend.get_tuple(&CheckpointRef::latest(thread_id)).await
    }

    /// Drop every checkpoint belonging to a thread.
    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<(), CheckpointerError> {
        self.backend.delete(&CheckpointRef::latest(thread_id)).await
    }

    pub async fn copy_thread(&self, from: Uuid, to: Uuid) -> Result<(), CheckpointerError> {
        self.backend.copy(from, to).await
    }
}

#[async_trait]
impl Checkpointer for CheckpointerProxy {
    async fn get_tuple(
        &self,
        config: &CheckpointRef,
    ) -> Result<Option<CheckpointTuple>, CheckpointerError> {
        self.backend.get_tuple(config).await
    }

    async fn list(
        &self,
        config: &CheckpointRef,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<CheckpointTuple>, CheckpointerError> {
        self.backend.list(config, limit, before).await
    }

    async fn put(
        &self,
        config: &CheckpointRef,
        checkpoint: Value,
        metadata: JsonMap,
    ) -> Result<CheckpointRef, CheckpointerError> {
        self.backend.put(config, checkpoint, metadata).await
    }

    async fn put_writes(
        &self,
        config: &CheckpointRef,
        task_id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<(), CheckpointerError> {
        self.backend.put_writes(config, task_id, writes).await
    }

    async fn delete(&self, config: &CheckpointRef) -> Result<(), CheckpointerError> {
        self.backend.delete(config).await
    }

    async fn copy(&self, from: Uuid, to: Uuid) -> Result<(), CheckpointerError> {
        self.backend.copy(from, to).await
    }

    async fn clear(&self) -> Result<(), CheckpointerError> {
        self.backend.clear().await
    }
}
