//! API routes

use axum::{routing::get, Router};

use crate::AppState;

mod runs;
mod state;
mod tasks;

/// Build the API router with all endpoints
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(crate::health))
        .nest("/runs", runs::router())
        .nest("/tasks", tasks::router())
        .nest("/state", state::router())
}
