//! HTTP façade (SPEC_FULL.md §4.9): thin axum layer translating the wire
//! protocol in §6 onto the core's traits and types. Kept deliberately dumb —
//! no business logic lives here beyond request parsing and status mapping.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
