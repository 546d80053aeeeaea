use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::http::error::ApiResult;
use crate::http::middleware::AuthContext;
use crate::http::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let handle = state
        .registry
        .resolve_or_create(&auth.user_id, &req.session_id)
        .await?;

    Ok(Json(SessionResponse {
        session_id: handle.session_id,
    }))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.destroy(&auth.user_id, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
