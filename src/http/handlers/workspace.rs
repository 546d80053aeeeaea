use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::workspace::FileContents;
use crate::http::error::{ApiError, ApiResult};
use crate::http::middleware::AuthContext;
use crate::http::state::AppState;

fn path_param(params: &HashMap<String, String>) -> String {
    params.get("path").cloned().unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct EntryJson {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    let handle = state
        .registry
        .resolve_existing(&auth.user_id, &session_id)
        .await?;

    let entries = state.workspace.list(&handle, &path_param(&params)).await?;
    let entries: Vec<EntryJson> = entries
        .into_iter()
        .map(|e| EntryJson {
            name: e.name,
            kind: match e.kind {
                crate::core::workspace::EntryKind::File => "file",
                crate::core::workspace::EntryKind::Directory => "directory",
                crate::core::workspace::EntryKind::Other => "other",
            },
        })
        .collect();

    Ok(Json(json!({ "entries": entries })))
}

pub async fn read_content(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    let handle = state
        .registry
        .resolve_existing(&auth.user_id, &session_id)
        .await?;

    let file = state.workspace.read(&handle, &path_param(&params)).await?;
    let body = match file.contents {
        FileContents::Utf8(text) => json!({ "content": text, "encoding": "utf8" }),
        FileContents::Base64(b64) => json!({ "content": b64, "encoding": "base64" }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct JsonContentBody {
    content: String,
}

pub async fn write_content(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<StatusCode> {
    let handle = state
        .registry
        .resolve_existing(&auth.user_id, &session_id)
        .await?;

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    let data: Vec<u8> = if is_json {
        let parsed: JsonContentBody = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
        parsed.content.into_bytes()
    } else {
        body.to_vec()
    };

    state
        .workspace
        .write(&handle, &path_param(&params), &data)
        .await?;

    Ok(StatusCode::OK)
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let handle = state
        .registry
        .resolve_existing(&auth.user_id, &session_id)
        .await?;

    let mut data: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            data = Some(bytes.to_vec());
        }
    }

    let data = data.ok_or_else(|| ApiError::BadRequest("missing 'file' field".to_string()))?;

    state
        .workspace
        .write(&handle, &path_param(&params), &data)
        .await?;

    Ok(StatusCode::CREATED)
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let handle = state
        .registry
        .resolve_existing(&auth.user_id, &session_id)
        .await?;

    state.workspace.delete(&handle, &path_param(&params)).await?;
    Ok(StatusCode::NO_CONTENT)
}
