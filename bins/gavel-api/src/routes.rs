// Route definitions for the Gavel API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::submit_job))
        .route("/job/:id", get(handlers::get_job))
        .route("/languages", get(handlers::list_languages))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
