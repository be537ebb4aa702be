//! # graphd Core
//!
//! Core abstractions and deterministic logic for the graphd control plane.
//!
//! This crate contains:
//! - Assistant / Thread / Run / RunConfig definitions
//! - The opaque graph interface (trait, registry, state snapshots)
//! - Checkpointer and key-value store traits
//! - A mock graph for end-to-end tests
//!
//! This crate does NOT care about:
//! - How graphs compute (they are injected, opaque objects)
//! - How state reaches disk (graphd-stores)
//! - How requests arrive (graphd-server)

pub mod checkpoint;
pub mod graph;
pub mod kv;
pub mod mock;
pub mod store;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{CheckpointRef, CheckpointTuple, Checkpointer, CheckpointerError};
    pub use crate::graph::{
        Graph, GraphContext, GraphError, GraphFactory, GraphInput, GraphRegistry, GraphStream,
        StateSnapshot, StateUpdate, StreamChunk, Superstep, TaskDescription,
    };
    pub use crate::kv::KvStore;
    pub use crate::store::StoreError;
    pub use crate::types::{
        Assistant, AssistantVersion, CancelAction, IfExists, IfNotExists, JsonMap,
        MultitaskStrategy, Run, RunConfig, RunKwargs, RunStatus, StreamMode, Thread, ThreadStatus,
    };
}

// Re-export key types at crate root
pub use checkpoint::{CheckpointRef, CheckpointTuple, Checkpointer, CheckpointerError};
pub use graph::{
    Graph, GraphContext, GraphError, GraphFactory, GraphInput, GraphRegistry, StateSnapshot,
    StreamChunk, Superstep, TaskDescription,
};
pub use kv::KvStore;
pub use store::StoreError;
pub use types::{
    Assistant, AssistantVersion, CancelAction, IfExists, IfNotExists, JsonMap, MultitaskStrategy,
    Run, RunConfig, RunKwargs, RunStatus, StreamMode, Thread, ThreadStatus,
};
