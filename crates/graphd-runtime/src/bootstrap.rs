//! Bootstrap helpers for starting graphd from a single YAML config.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use graphd_core::checkpoint::Checkpointer;
use graphd_core::graph::GraphRegistry;
use graphd_core::kv::KvStore;
use graphd_core::store::StoreError;
use graphd_stores::{CheckpointerProxy, InMemoryCheckpointer, InMemoryKvStore, StateStore, StreamBus};

use crate::assistants::Assistants;
use crate::config::{load_config, ConfigError, GraphdConfig};
use crate::executor::{Executor, ExecutorConfig};
use crate::picker::Picker;
use crate::runs::Runs;
use crate::threads::Threads;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("graph '{0}' named in config is not registered")]
    UnknownGraph(String),
}

/// Running app bundle created from unified config: stores, services, and the
/// background picker/executor and flusher tasks.
pub struct RuntimeApp {
    pub config: GraphdConfig,
    pub state: Arc<StateStore>,
    pub bus: Arc<StreamBus>,
    pub graphs: Arc<GraphRegistry>,
    pub assistants: Assistants,
    pub threads: Threads,
    pub runs: Runs,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RuntimeApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeApp").finish_non_exhaustive()
    }
}

/// Install the global tracing subscriber once.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

impl RuntimeApp {
    /// Load config from `path` and build the app with the given registry and
    /// the in-memory checkpoint backend.
    pub async fn from_config_path(
        path: &Path,
        registry: GraphRegistry,
    ) -> Result<Self, BootstrapError> {
        let config = load_config(path)?;
        Self::build(config, registry, None, None).await
    }

    /// Wire everything together. `checkpointer` and `kv` default to the
    /// in-memory backends when not injected.
    pub async fn build(
        config: GraphdConfig,
        registry: GraphRegistry,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        kv: Option<Arc<dyn KvStore>>,
    ) -> Result<Self, BootstrapError> {
        for spec in &config.graphs {
            if !registry.contains(&spec.id) {
                return Err(BootstrapError::UnknownGraph(spec.id.clone()));
            }
        }

        let state = match &config.state.path {
            Some(path) => Arc::new(StateStore::load(path.clone())?),
            None => Arc::new(StateStore::in_memory()),
        };
        let bus = Arc::new(StreamBus::new());
        let graphs = Arc::new(registry);
        let checkpointer = CheckpointerProxy::new(
            checkpointer.unwrap_or_else(|| Arc::new(InMemoryCheckpointer::new())),
        );
        let kv = kv.unwrap_or_else(|| Arc::new(InMemoryKvStore::new()));

        let assistants = Assistants::new(Arc::clone(&state), Arc::clone(&bus), Arc::clone(&graphs));
        let threads = Threads::new(
            Arc::clone(&state),
            Arc::clone(&bus),
            checkpointer.clone(),
            Arc::clone(&graphs),
            kv,
        );
        let wake = Arc::new(Notify::new());
        let runs = Runs::new(
            Arc::clone(&state),
            Arc::clone(&bus),
            checkpointer,
            threads.clone(),
            Arc::clone(&wake),
        );

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();

        let flusher = state.spawn_flusher(
            Duration::from_secs(config.state.flush_interval_secs),
            shutdown.clone(),
        );
        background.push(flusher);

        let executor = Arc::new(Executor::new(
            Arc::clone(&bus),
            threads.clone(),
            runs.clone(),
            ExecutorConfig {
                workers: config.executor.workers,
                max_attempts: config.executor.max_attempts,
                grace_period: Duration::from_secs(config.executor.grace_period_secs),
                ..ExecutorConfig::default()
            },
        ));
        let picker = Picker::new(Arc::clone(&state), Arc::clone(&bus), wake);
        background.push(executor.spawn(picker, shutdown.clone()));

        Ok(Self {
            config,
            state,
            bus,
            graphs,
            assistants,
            threads,
            runs,
            shutdown,
            background: Mutex::new(background),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background work and flush the aggregate document one last time.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().expect("background handles poisoned");
            background.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background task did not shut down cleanly");
            }
        }
        // The flusher already flushed on cancel; this covers mutations that
        // raced shutdown.
        self.state.flush().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphd_core::mock::{MockGraph, MockGraphFactory};
    use graphd_core::types::{IfExists, JsonMap, RunConfig};
    use serde_json::json;
    use uuid::Uuid;

    fn registry_with_agent() -> (GraphRegistry, Arc<InMemoryCheckpointer>) {
        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let mut registry = GraphRegistry::new();
        registry.register(
            "agent",
            Arc::new(MockGraphFactory::new(MockGraph::new(
                Arc::clone(&checkpointer) as Arc<dyn Checkpointer>,
            ))),
        );
        (registry, checkpointer)
    }

    fn ephemeral_config() -> GraphdConfig {
        let mut config = GraphdConfig::default();
        config.state.path = None;
        config.graphs = vec![crate::config::GraphSpec {
            id: "agent".to_string(),
        }];
        config
    }

    #[test]
    fn test_build_rejects_unregistered_graph() {
        tokio_test::block_on(async {
            let (registry, _) = registry_with_agent();
            let mut config = ephemeral_config();
            config.graphs.push(crate::config::GraphSpec {
                id: "missing".to_string(),
            });
            let err = RuntimeApp::build(config, registry, None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, BootstrapError::UnknownGraph(_)));
        });
    }

    #[test]
    fn test_end_to_end_run_through_background_loop() {
        tokio_test::block_on(async {
            let (registry, checkpointer) = registry_with_agent();
            let app = RuntimeApp::build(
                ephemeral_config(),
                registry,
                Some(checkpointer as Arc<dyn Checkpointer>),
                None,
            )
            .await
            .unwrap();

            let assistant = app
                .assistants
                .put(
                    Uuid::new_v4(),
                    "agent".to_string(),
                    RunConfig::default(),
                    JsonMap::new(),
                    None,
                    IfExists::Raise,
                )
                .await
                .unwrap();

            let thread_id = Uuid::new_v4();
            let mut request = crate::runs::RunCreate::for_assistant(
                assistant.assistant_id,
                json!({"x": 1}),
            );
            request.if_not_exists = graphd_core::types::IfNotExists::Create;
            let run = app.runs.create(thread_id, request).await.unwrap();

            // The background picker/executor settles the run on its own.
            let value = app.runs.join(run.run_id, thread_id).await.unwrap();
            assert_eq!(value, json!({"x": 1}));

            let state = app
                .threads
                .state_get(thread_id, None, false)
                .await
                .unwrap();
            assert_eq!(state.values, json!({"x": 1}));

            app.shutdown().await.unwrap();
        });
    }
}
