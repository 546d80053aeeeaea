use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::http::middleware::auth_middleware;
use crate::http::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready));

    let protected_routes = Router::new()
        .route("/execute", post(handlers::execute::execute))
        .route("/sessions", post(handlers::sessions::create_session))
        .route("/sessions/{sid}", delete(handlers::sessions::delete_session))
        .route("/sessions/{sid}/workspace", get(handlers::workspace::list))
        .route("/sessions/{sid}/workspace", delete(handlers::workspace::delete))
        .route(
            "/sessions/{sid}/workspace/content",
            get(handlers::workspace::read_content),
        )
        .route(
            "/sessions/{sid}/workspace/content",
            put(handlers::workspace::write_content),
        )
        .route(
            "/sessions/{sid}/workspace/upload",
            post(handlers::workspace::upload),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    public_routes
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
