//! JSON API over [`Engine`].

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::core::engine::Engine;

pub mod errors;
pub mod handlers;
pub mod mappers;
pub mod models;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route(
            "/runtimes",
            get(handlers::list_runtimes).post(handlers::install_runtime),
        )
        .route("/runtimes/{id}", delete(handlers::delete_runtime))
        .route("/execute", post(handlers::execute))
        .route("/update", post(handlers::update))
        .with_state(engine)
}
