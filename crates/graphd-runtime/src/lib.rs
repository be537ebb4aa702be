//! # graphd Runtime
//!
//! The run-lifecycle engine of graphd: assistant/thread/run services over the
//! shared state store, the pending-run picker, and the executor that drives
//! graph invocations and fans their output onto the Stream Bus.

pub mod assistants;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod executor;
pub mod multitask;
pub mod picker;
pub mod runs;
pub mod threads;

pub use assistants::{AssistantPatch, AssistantSearch, Assistants};
pub use bootstrap::{init_tracing, BootstrapError, RuntimeApp};
pub use config::{load_config, validate_config, ConfigError, GraphdConfig};
pub use error::RuntimeError;
pub use executor::{Executor, ExecutorConfig};
pub use multitask::{decide, MultitaskDecision};
pub use picker::{Picker, ScheduledRun};
pub use runs::{JoinOptions, RunCreate, RunInsert, RunSearch, Runs};
pub use threads::{ThreadSearch, Threads};
