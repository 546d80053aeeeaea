use thiserror::Error;

/// Error kinds the core surfaces to callers. The HTTP layer maps these to
/// status codes (see `http::error::ApiError`); `AuthRequired` is never raised
/// from here since bearer-token parsing happens entirely in the HTTP layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("session {user}/{session_id} is owned by a different user")]
    Forbidden { user: String, session_id: String },

    #[error("session {user}/{session_id} not found")]
    SessionNotFound { user: String, session_id: String },

    #[error("command '{0}' is not in the allowed-commands whitelist")]
    CommandNotAllowed(String),

    #[error("workspace path is invalid: {0}")]
    PathInvalid(String),

    #[error("size limit exceeded: {actual} bytes > {limit} bytes")]
    SizeLimitExceeded { actual: u64, limit: u64 },

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("engine resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
