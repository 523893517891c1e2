use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, extract::State};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::data_models::StreamEvent;
use crate::error::AppError;
use crate::pipeline::Pipeline;

use super::models::{ChatRequest, SearchRequest, SearchResponse};

pub const CHAT_FAILURE: &str = "Failed to get response";
pub const SEARCH_FAILURE: &str = "Failed to search";

pub async fn chat_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let query = request.message.trim().to_string();
    if query.is_empty() {
        return AppError::BadRequest("Message cannot be empty".to_string())
            .into_response_with(CHAT_FAILURE);
    }

    match pipeline.chat(query).await {
        Ok(events) => ndjson_response(events),
        Err(e) => e.into_response_with(CHAT_FAILURE),
    }
}

pub async fn search_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<SearchRequest>,
) -> Response {
    let start = Instant::now();

    let query = request.query.trim();
    if query.is_empty() {
        return AppError::BadRequest("Query cannot be empty".to_string())
            .into_response_with(SEARCH_FAILURE);
    }

    match pipeline.search(query).await {
        Ok(search_results) => {
            log::info!(
                "search for {:?} took {}ms",
                query,
                start.elapsed().as_millis()
            );
            Json(SearchResponse { search_results }).into_response()
        }
        Err(e) => e.into_response_with(SEARCH_FAILURE),
    }
}

/// Streams events as newline-delimited JSON, one line per event, flushed as
/// each event arrives.
fn ndjson_response(events: mpsc::Receiver<StreamEvent>) -> Response {
    let lines = futures::stream::unfold(events, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .filter_map(|event| async move {
        match event.to_ndjson_line() {
            Ok(line) => Some(Ok::<_, Infallible>(line)),
            Err(e) => {
                log::error!("failed to encode stream event: {:#}", e);
                None
            }
        }
    });

    let mut response = Body::from_stream(lines).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}
