use axum::{extract::{Extension, State}, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::http::error::{ApiError, ApiResult};
use crate::http::middleware::AuthContext;
use crate::http::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
    pub session_id: String,
    pub timeout: Option<u64>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub truncated: bool,
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecuteResponse>> {
    // Input-validation whitelist check owned by the HTTP layer (SPEC_FULL.md
    // §4.9); the executor re-checks it independently as defense in depth.
    // An empty whitelist means nothing is allowed, not everything.
    let allowed = &state.config.allowed_commands;
    let program = req
        .command
        .split_whitespace()
        .next()
        .ok_or_else(|| ApiError::BadRequest("empty command".to_string()))?;
    if !allowed.contains(program) {
        return Err(ApiError::BadRequest(format!(
            "command '{program}' is not in the allowed-commands whitelist"
        )));
    }

    let handle = state
        .registry
        .resolve_or_create(&auth.user_id, &req.session_id)
        .await?;

    let outcome = state
        .executor
        .execute(
            &handle,
            &req.command,
            req.working_dir.as_deref(),
            req.timeout.map(Duration::from_secs),
        )
        .await?;

    Ok(Json(ExecuteResponse {
        exit_code: outcome.exit_code,
        stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
        timed_out: outcome.timed_out,
        duration_ms: outcome.duration_ms,
        truncated: outcome.truncated,
    }))
}
