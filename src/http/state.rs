//! Shared application state handed to every axum handler, following the
//! teacher's `shared::models::AppState` convention (one `Arc<AppState>`
//! cloned per request).

use std::sync::Arc;

use crate::config::Config;
use crate::core::driver::ContainerDriver;
use crate::core::executor::Executor;
use crate::core::registry::SessionRegistry;
use crate::core::workspace::WorkspaceGateway;

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub executor: Arc<Executor>,
    pub workspace: Arc<WorkspaceGateway>,
    pub driver: Arc<dyn ContainerDriver>,
    pub config: Arc<Config>,
}
