//! Boot Manager Service
//!
//! REST API for provisioning diskless clients: each client gets a private
//! ZFS clone of a master image, exported over iSCSI and announced through a
//! DHCP reservation.

pub mod config;
pub mod handlers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use handlers::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/api/clients",
            get(handlers::list_clients_handler).post(handlers::create_client_handler),
        )
        .route(
            "/api/clients/{id}",
            get(handlers::get_client_handler).delete(handlers::delete_client_handler),
        )
        .route(
            "/api/clients/edit/{id}",
            post(handlers::edit_client_handler),
        )
        .route(
            "/api/clients/reset/{id}",
            post(handlers::reset_client_handler),
        )
        .route(
            "/api/clients/{id}/control",
            post(handlers::control_client_handler),
        )
        .route("/api/masters", get(handlers::list_masters_handler))
        .route("/api/snapshots", post(handlers::create_snapshot_handler))
        .route(
            "/api/snapshots/{*name}",
            delete(handlers::delete_snapshot_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
