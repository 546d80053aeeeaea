//! Request-level middleware: bearer-token authentication and access logging,
//! adapted from the teacher's `api/rest/middleware.rs`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::info;

use crate::http::auth::decode_jwt;
use crate::http::error::ApiError;
use crate::http::state::AppState;

#[derive(Clone)]
pub struct AuthContext {
    pub user_id: String,
}

const PUBLIC_PATHS: &[&str] = &["/health", "/ready"];

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();
    if PUBLIC_PATHS.contains(&path) {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?;

    let claims = decode_jwt(token, &state.config.jwt_secret).map_err(|_| ApiError::Unauthorized)?;

    let method = request.method().clone();
    let uri = request.uri().clone();
    info!(method = %method, path = %uri.path(), user = %claims.sub, "API request");

    request.extensions_mut().insert(AuthContext { user_id: claims.sub });

    Ok(next.run(request).await)
}
