// src/server/routes.rs

//! Axum router configuration

use crate::server::handlers;
use crate::setup::ServiceSetup;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(setup: Arc<ServiceSetup>) -> Router {
    Router::new()
        .route("/api/v0/packages", get(handlers::search_packages))
        .route(
            "/api/v0/build-actions",
            get(handlers::list_build_actions).post(handlers::create_build_action),
        )
        .route("/api/v0/build-actions/:id", get(handlers::get_build_action))
        .route(
            "/api/v0/build-actions/:id/abort",
            post(handlers::abort_build_action),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(setup)
}
