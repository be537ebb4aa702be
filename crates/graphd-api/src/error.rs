use thiserror::Error;

use graphd_runtime::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Conflict,
    BadRequest,
    Validation,
    Internal,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(message) => ApiError::NotFound(message),
            RuntimeError::Conflict(message) => ApiError::Conflict(message),
            RuntimeError::BadRequest(message) => ApiError::BadRequest(message),
            RuntimeError::Validation(message) => ApiError::Validation(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_map_to_codes() {
        let not_found: ApiError = RuntimeError::NotFound("run 'x'".to_string()).into();
        assert_eq!(not_found.code(), ErrorCode::NotFound);

        let conflict: ApiError = RuntimeError::Conflict("busy".to_string()).into();
        assert_eq!(conflict.code(), ErrorCode::Conflict);

        let internal: ApiError = RuntimeError::Internal("oops".to_string()).into();
        assert_eq!(internal.code(), ErrorCode::Internal);
    }
}
