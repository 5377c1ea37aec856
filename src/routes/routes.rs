//! HTTP routes. Client sessions do not go through HTTP; this router only
//! exposes the probes used by process supervisors.
//!
//! - `GET /healthz` — liveness
//! - `GET /readyz`  — readiness (database, schema, storage directory)

use crate::{
    handlers::health_handlers::{healthz, readyz},
    services::storage_service::StorageService,
};
use axum::{Router, routing::get};

/// Build the probe router. The `StorageService` state gives `/readyz` access
/// to the metadata pool and the storage directory.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
