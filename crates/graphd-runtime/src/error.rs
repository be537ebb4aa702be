//! Runtime error type shared by the services.

use thiserror::Error;

use graphd_core::checkpoint::CheckpointerError;
use graphd_core::graph::GraphError;
use graphd_core::store::StoreError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointerError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("internal: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        RuntimeError::NotFound(format!("{what} '{id}'"))
    }
}
