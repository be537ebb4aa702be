//! # graphd Stores
//!
//! Storage primitives for the graphd control plane.
//!
//! This crate provides:
//! - The sharded state store with its aggregate on-disk document and flusher
//! - The per-run Stream Bus (queues + cancellation handles)
//! - The in-memory checkpointer and the delegating checkpointer proxy
//! - The in-memory key-value store handed to graphs

mod bus;
mod checkpointer;
mod kv;
mod state;

pub use bus::{BusError, RunControl, RunQueue, StreamBus, StreamMessage};
pub use checkpointer::{CheckpointerProxy, InMemoryCheckpointer};
pub use kv::InMemoryKvStore;
pub use state::{AssistantShard, RunShard, StateDocument, StateStore, ThreadShard};

// Re-export core traits for convenience
pub use graphd_core::checkpoint::{CheckpointRef, CheckpointTuple, Checkpointer, CheckpointerError};
pub use graphd_core::kv::KvStore;
pub use graphd_core::store::StoreError;
