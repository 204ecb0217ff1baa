// src/server/mod.rs

//! HTTP surface of the build service
//!
//! Exposes package search plus the build-action engine (list/create/get/
//! abort) under `/api/v0/`. The handlers operate on the shared
//! [`ServiceSetup`]; request handling never blocks on child processes, only
//! on the in-memory locks.

mod handlers;
mod routes;

pub use routes::create_router;

use crate::error::{Error, Result};
use crate::setup::ServiceSetup;
use std::sync::Arc;
use tracing::info;

/// Run the HTTP server until the process is terminated
pub async fn run_server(setup: Arc<ServiceSetup>) -> Result<()> {
    let bind_address = setup.web_bind_address.clone();
    let app = create_router(Arc::clone(&setup));
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|e| Error::Io(format!("Unable to bind {bind_address}: {e}")))?;
    info!("Listening on {bind_address}");
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Io(format!("HTTP server failed: {e}")))?;
    Ok(())
}
