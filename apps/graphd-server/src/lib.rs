use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{pin_mut, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use graphd_api::{
    ApiError, AssistantCreateRequest, AssistantPatchRequest, AssistantSearchRequest,
    BatchStateRequest, ErrorCode, HistoryQuery, HistoryRequest, RunCancelRequest, RunCreate,
    RunListQuery, SetLatestRequest, StateAtCheckpointRequest, StateUpdateRequest,
    StateUpdateResponse, SubgraphsQuery, ThreadCreateRequest, ThreadPatchRequest,
    ThreadSearchRequest,
};
use graphd_core::graph::GraphRegistry;
use graphd_core::types::CancelAction;
use graphd_runtime::{
    AssistantPatch, AssistantSearch, JoinOptions, RunSearch, RuntimeApp, ThreadSearch,
};

#[derive(Clone)]
struct AppState {
    app: Arc<RuntimeApp>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type HandlerError = (StatusCode, Json<ErrorBody>);

pub async fn run_server(
    config: PathBuf,
    listen: Option<SocketAddr>,
    registry: GraphRegistry,
) -> anyhow::Result<()> {
    let app = Arc::new(
        RuntimeApp::from_config_path(&config, registry)
            .await
            .context("build runtime app failed")?,
    );
    let listen = listen.unwrap_or(app.config.server.listen);

    let router = build_router(AppState {
        app: Arc::clone(&app),
    });

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .context("bind server listener failed")?;
    tracing::info!(listen = %listen, "graphd-server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server terminated with error")?;

    app.shutdown().await.context("final state flush failed")?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/threads", post(create_thread))
        .route("/threads/search", post(search_threads))
        .route("/threads/state/batch", post(batch_thread_state))
        .route(
            "/threads/{thread_id}",
            get(get_thread).patch(patch_thread).delete(delete_thread),
        )
        .route("/threads/{thread_id}/copy", post(copy_thread))
        .route(
            "/threads/{thread_id}/state",
            get(get_thread_state).post(update_thread_state),
        )
        .route(
            "/threads/{thread_id}/state/checkpoint",
            post(thread_state_at_checkpoint),
        )
        .route(
            "/threads/{thread_id}/state/{checkpoint_id}",
            get(get_thread_state_at),
        )
        .route(
            "/threads/{thread_id}/history",
            get(thread_history_query).post(thread_history),
        )
        .route("/assistants", post(create_assistant))
        .route("/assistants/search", post(search_assistants))
        .route(
            "/assistants/{assistant_id}",
            get(get_assistant)
                .patch(patch_assistant)
                .delete(delete_assistant),
        )
        .route("/assistants/{assistant_id}/latest", post(set_latest_assistant))
        .route("/assistants/{assistant_id}/versions", get(assistant_versions))
        .route(
            "/threads/{thread_id}/runs",
            get(list_runs).post(create_run),
        )
        .route("/threads/{thread_id}/runs/stream", post(create_run_stream))
        .route("/threads/{thread_id}/runs/wait", post(create_run_wait))
        .route(
            "/threads/{thread_id}/runs/{run_id}",
            get(get_run).delete(delete_run),
        )
        .route("/threads/{thread_id}/runs/{run_id}/stream", get(stream_run))
        .route("/threads/{thread_id}/runs/{run_id}/join", get(join_run))
        .route("/threads/{thread_id}/runs/{run_id}/cancel", post(cancel_run))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// Threads

async fn create_thread(
    State(state): State<AppState>,
    Json(body): Json<ThreadCreateRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let thread_id = body.thread_id.unwrap_or_else(Uuid::new_v4);
    let thread = state
        .app
        .threads
        .put(thread_id, body.metadata, body.if_exists)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(thread))
}

async fn search_threads(
    State(state): State<AppState>,
    Json(body): Json<ThreadSearchRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let threads = state
        .app
        .threads
        .search(ThreadSearch {
            status: body.status,
            values: body.values,
            metadata: body.metadata,
            limit: body.limit,
            offset: body.offset,
        })
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(threads))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let thread = state
        .app
        .threads
        .get(thread_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(thread))
}

async fn patch_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<ThreadPatchRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let thread = state
        .app
        .threads
        .patch(thread_id, body.metadata)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(thread))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    state
        .app
        .threads
        .delete(thread_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn copy_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let copy = state
        .app
        .threads
        .copy(thread_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(copy))
}

// Thread state

async fn get_thread_state(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<SubgraphsQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let snapshot = state
        .app
        .threads
        .state_get(thread_id, None, query.subgraphs.unwrap_or(false))
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(snapshot))
}

async fn update_thread_state(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<StateUpdateRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let checkpoint_id = body.target_checkpoint();
    let checkpoint = state
        .app
        .threads
        .state_post(
            thread_id,
            body.values,
            body.as_node.as_deref(),
            checkpoint_id.as_deref(),
        )
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(StateUpdateResponse { checkpoint }))
}

async fn get_thread_state_at(
    State(state): State<AppState>,
    Path((thread_id, checkpoint_id)): Path<(Uuid, String)>,
    Query(query): Query<SubgraphsQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let snapshot = state
        .app
        .threads
        .state_get(
            thread_id,
            Some(&checkpoint_id),
            query.subgraphs.unwrap_or(false),
        )
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(snapshot))
}

async fn thread_state_at_checkpoint(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<StateAtCheckpointRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let checkpoint_id = body
        .checkpoint
        .as_ref()
        .and_then(|checkpoint| checkpoint.checkpoint_id.clone());
    let snapshot = state
        .app
        .threads
        .state_get(
            thread_id,
            checkpoint_id.as_deref(),
            body.subgraphs.unwrap_or(false),
        )
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(snapshot))
}

async fn thread_history_query(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let history = state
        .app
        .threads
        .state_history(thread_id, query.limit, query.before.as_deref(), None)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(history))
}

async fn thread_history(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<HistoryRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let history = state
        .app
        .threads
        .state_history(
            thread_id,
            body.limit,
            body.before.as_deref(),
            body.metadata.as_ref(),
        )
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(history))
}

async fn batch_thread_state(
    State(state): State<AppState>,
    Json(body): Json<BatchStateRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let thread = state
        .app
        .threads
        .state_batch(body.thread_id, body.supersteps, body.metadata, body.if_exists)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(thread))
}

// Assistants

async fn create_assistant(
    State(state): State<AppState>,
    Json(body): Json<AssistantCreateRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let assistant_id = body.assistant_id.unwrap_or_else(Uuid::new_v4);
    let assistant = state
        .app
        .assistants
        .put(
            assistant_id,
            body.graph_id,
            body.config,
            body.metadata,
            body.name,
            body.if_exists,
        )
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(assistant))
}

async fn search_assistants(
    State(state): State<AppState>,
    Json(body): Json<AssistantSearchRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let assistants = state
        .app
        .assistants
        .search(AssistantSearch {
            graph_id: body.graph_id,
            metadata: body.metadata,
            limit: body.limit,
            offset: body.offset,
        })
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(assistants))
}

async fn get_assistant(
    State(state): State<AppState>,
    Path(assistant_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let assistant = state
        .app
        .assistants
        .get(assistant_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(assistant))
}

async fn patch_assistant(
    State(state): State<AppState>,
    Path(assistant_id): Path<Uuid>,
    Json(body): Json<AssistantPatchRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let assistant = state
        .app
        .assistants
        .patch(
            assistant_id,
            AssistantPatch {
                graph_id: body.graph_id,
                config: body.config,
                metadata: body.metadata,
                name: body.name,
            },
        )
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(assistant))
}

async fn delete_assistant(
    State(state): State<AppState>,
    Path(assistant_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    state
        .app
        .assistants
        .delete(assistant_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_latest_assistant(
    State(state): State<AppState>,
    Path(assistant_id): Path<Uuid>,
    Json(body): Json<SetLatestRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let assistant = state
        .app
        .assistants
        .set_latest(assistant_id, body.version)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(assistant))
}

async fn assistant_versions(
    State(state): State<AppState>,
    Path(assistant_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let versions = state
        .app
        .assistants
        .versions(assistant_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(versions))
}

// Runs

async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<RunCreate>,
) -> Result<impl IntoResponse, HandlerError> {
    let run = state
        .app
        .runs
        .create(thread_id, body)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(run))
}

async fn list_runs(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<RunListQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    // Surface a 404 for unknown threads instead of an empty list.
    state
        .app
        .threads
        .get(thread_id)
        .await
        .map_err(map_runtime_error)?;
    let runs = state
        .app
        .runs
        .search(
            thread_id,
            RunSearch {
                status: query.status,
                metadata: None,
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, HandlerError> {
    let run = state
        .app
        .runs
        .get(run_id, Some(thread_id))
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(run))
}

async fn delete_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, HandlerError> {
    state
        .app
        .runs
        .delete(run_id, Some(thread_id))
        .await
        .map_err(map_runtime_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<RunCancelRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    state
        .app
        .runs
        .cancel(Some(thread_id), &[run_id], body.action)
        .await
        .map_err(map_runtime_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, HandlerError> {
    state
        .app
        .runs
        .get(run_id, Some(thread_id))
        .await
        .map_err(map_runtime_error)?;
    Ok(run_sse(state, thread_id, run_id))
}

async fn create_run_stream(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<RunCreate>,
) -> Result<impl IntoResponse, HandlerError> {
    let run = state
        .app
        .runs
        .create(thread_id, body)
        .await
        .map_err(map_runtime_error)?;
    Ok(run_sse(state, thread_id, run.run_id))
}

async fn create_run_wait(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<RunCreate>,
) -> Result<impl IntoResponse, HandlerError> {
    let run = state
        .app
        .runs
        .create(thread_id, body)
        .await
        .map_err(map_runtime_error)?;
    let value = state
        .app
        .runs
        .join(run.run_id, thread_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(value))
}

async fn join_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, HandlerError> {
    let value = state
        .app
        .runs
        .join(run_id, thread_id)
        .await
        .map_err(map_runtime_error)?;
    Ok(Json(value))
}

/// SSE framing of a run's stream: `event:` carries the short topic, `data:`
/// the JSON payload. The connection closes after the `control:done` message.
/// Dropping the connection while the run is active cancels it with
/// `interrupt`.
fn run_sse(
    state: AppState,
    thread_id: Uuid,
    run_id: Uuid,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let disconnect = CancellationToken::new();
    spawn_disconnect_watcher(Arc::clone(&state.app), thread_id, run_id, disconnect.clone());

    let app = Arc::clone(&state.app);
    let event_stream = stream! {
        // Fires on drop; the watcher decides whether a cancel is due.
        let _guard = disconnect.clone().drop_guard();
        let inner = app.runs.join_stream(
            run_id,
            Some(thread_id),
            JoinOptions {
                disconnect: disconnect.clone(),
                cancel_on_disconnect: false,
            },
        );
        pin_mut!(inner);
        while let Some(message) = inner.next().await {
            let payload = message.data.to_string();
            yield Ok(SseEvent::default().event(message.event_name()).data(payload));
        }
    };

    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}

/// Cancel the run with `interrupt` when the subscriber goes away while the
/// run is still active. A token fired after normal completion is a no-op.
fn spawn_disconnect_watcher(
    app: Arc<RuntimeApp>,
    thread_id: Uuid,
    run_id: Uuid,
    disconnect: CancellationToken,
) {
    tokio::spawn(async move {
        disconnect.cancelled().await;
        match app.runs.get(run_id, Some(thread_id)).await {
            Ok(run) if run.status.is_active() => {
                if let Err(err) = app
                    .runs
                    .cancel(Some(thread_id), &[run_id], CancelAction::Interrupt)
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %err, "cancel on disconnect failed");
                }
            }
            _ => {}
        }
    });
}

fn map_runtime_error(err: graphd_runtime::RuntimeError) -> HandlerError {
    map_api_error(ApiError::from(err))
}

fn map_api_error(err: ApiError) -> HandlerError {
    let status = match err.code() {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}

/// Register the built-in echo graph under every graph id the config names
/// but the embedder did not provide. The factory binds each instance to the
/// runtime's injected checkpointer, so a bare `graphd-server` stays usable
/// without a real graph library wired in.
pub fn fill_registry_with_builtin(
    registry: &mut GraphRegistry,
    config_path: &std::path::Path,
) -> anyhow::Result<()> {
    use graphd_core::mock::{MockGraph, MockGraphFactory};
    use graphd_stores::InMemoryCheckpointer;

    let config = graphd_runtime::load_config(config_path).context("load config failed")?;
    for spec in &config.graphs {
        if !registry.contains(&spec.id) {
            tracing::warn!(graph_id = %spec.id, "no factory registered; using built-in echo graph");
            let placeholder = Arc::new(InMemoryCheckpointer::new());
            registry.register(
                spec.id.clone(),
                Arc::new(MockGraphFactory::new(MockGraph::new(placeholder))),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_matches_contract() {
        let (status, _) = map_api_error(ApiError::NotFound("thread 'x'".to_string()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = map_api_error(ApiError::Conflict("busy".to_string()));
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = map_api_error(ApiError::BadRequest("no graph".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = map_api_error(ApiError::Validation("bad field".to_string()));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
