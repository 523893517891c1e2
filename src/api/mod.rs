use axum::{Router, routing::post};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::pipeline::Pipeline;

pub mod handlers;
pub mod models;

pub fn create_router(pipeline: Arc<Pipeline>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handlers::chat_handler))
        .route("/search", post(handlers::search_handler))
        // paths used by the bundled web client
        .route("/api/chat", post(handlers::chat_handler))
        .route("/api/search", post(handlers::search_handler))
        .with_state(pipeline)
        .layer(cors)
}
