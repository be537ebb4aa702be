mod dto;
mod error;

pub use dto::{
    AssistantCreateRequest, AssistantPatchRequest, AssistantSearchRequest, BatchStateRequest,
    CheckpointBody, HistoryQuery, HistoryRequest, RunCancelRequest, RunListQuery,
    SetLatestRequest, StateAtCheckpointRequest, StateUpdateRequest, StateUpdateResponse,
    SubgraphsQuery, ThreadCreateRequest, ThreadPatchRequest, ThreadSearchRequest,
};
pub use error::{ApiError, ErrorCode};

// The run-creation body is the runtime's own request type.
pub use graphd_runtime::RunCreate;
