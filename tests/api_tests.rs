use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::post};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use scout::api::create_router;
use scout::config::Config;
use scout::pipeline::Pipeline;

mod test_helpers {
    use super::*;

    pub fn ndjson(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            let line = json!({
                "model": "test-model",
                "message": { "role": "assistant", "content": fragment },
                "done": false,
            });
            body.push_str(&line.to_string());
            body.push('\n');
        }
        body.push_str(&json!({ "model": "test-model", "done": true }).to_string());
        body.push('\n');
        body
    }

    pub fn provider_results(n: usize) -> Value {
        let results: Vec<Value> = (0..n)
            .map(|i| {
                json!({
                    "title": format!("Source {i}"),
                    "content": format!("snippet {i}"),
                    "url": format!("https://news{i}.example.com/ai"),
                })
            })
            .collect();
        json!({ "query": "ignored", "results": results })
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub struct Upstreams {
        pub model_url: String,
        pub search_url: String,
        pub search_hits: Arc<AtomicUsize>,
        pub report_prompts: Arc<Mutex<Vec<String>>>,
    }

    pub struct Script {
        pub model_status: StatusCode,
        pub gate_body: String,
        /// Drop the gate connection right after `gate_body`.
        pub gate_cut: bool,
        pub report_body: String,
        pub search_status: StatusCode,
        pub search_body: Value,
    }

    impl Default for Script {
        fn default() -> Self {
            Script {
                model_status: StatusCode::OK,
                gate_body: ndjson(&["<confident>ok</confident>"]),
                gate_cut: false,
                report_body: ndjson(&["report"]),
                search_status: StatusCode::OK,
                search_body: provider_results(3),
            }
        }
    }

    /// Starts a chat backend and a search provider that follow `script`.
    /// The backend tells the two model calls apart by their system prompt.
    pub async fn start(script: Script) -> Upstreams {
        let report_prompts = Arc::new(Mutex::new(Vec::new()));
        let prompts = report_prompts.clone();
        let Script {
            model_status,
            gate_body,
            gate_cut,
            report_body,
            search_status,
            search_body,
        } = script;

        let model = Router::new().route(
            "/api/chat",
            post(move |Json(req): Json<Value>| {
                let prompts = prompts.clone();
                let gate_body = gate_body.clone();
                let report_body = report_body.clone();
                async move {
                    if model_status != StatusCode::OK {
                        return model_status.into_response();
                    }
                    let system = req["messages"][0]["content"].as_str().unwrap_or_default();
                    let body = if system.contains("<confident>") {
                        if gate_cut {
                            let chunks: Vec<Result<String, std::io::Error>> = vec![
                                Ok(gate_body),
                                Err(std::io::Error::other("backend went away")),
                            ];
                            return Body::from_stream(futures::stream::iter(chunks)).into_response();
                        }
                        gate_body
                    } else {
                        let user = req["messages"][1]["content"].as_str().unwrap_or_default();
                        prompts.lock().unwrap().push(user.to_string());
                        report_body
                    };
                    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
                }
            }),
        );

        let search_hits = Arc::new(AtomicUsize::new(0));
        let hits = search_hits.clone();
        let search = Router::new().route(
            "/search",
            post(move |Json(_req): Json<Value>| {
                let hits = hits.clone();
                let search_body = search_body.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (search_status, Json(search_body)).into_response()
                }
            }),
        );

        Upstreams {
            model_url: format!("{}/api/chat", serve(model).await),
            search_url: format!("{}/search", serve(search).await),
            search_hits,
            report_prompts,
        }
    }

    pub fn app(upstreams: &Upstreams, retries: u32) -> Router {
        let config = Config {
            search_api_key: "test-key".into(),
            search_api_url: upstreams.search_url.clone(),
            model_api_url: upstreams.model_url.clone(),
            model_name: "test-model".into(),
            bind_addr: "127.0.0.1:0".into(),
            stage_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            upstream_retries: retries,
            freeze_answer: false,
        };
        create_router(Arc::new(Pipeline::from_config(&config)))
    }

    pub async fn post_json(app: Router, uri: &str, body: Value) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        app.oneshot(request).await.unwrap()
    }

    pub async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    pub async fn stream_lines(response: Response) -> Vec<Value> {
        body_text(response)
            .await
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

use test_helpers::*;

#[tokio::test]
async fn test_confident_answer_skips_search() {
    let upstreams = start(Script {
        gate_body: ndjson(&[
            "<confident>Paris is the capital",
            " of France.</confident>",
        ]),
        ..Default::default()
    })
    .await;

    let response = post_json(
        app(&upstreams, 1),
        "/chat",
        json!({ "message": "What is the capital of France?" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let lines = stream_lines(response).await;
    assert_eq!(
        lines,
        vec![json!({
            "type": "answer",
            "content": "<confident>Paris is the capital of France.</confident>"
        })]
    );
    assert_eq!(upstreams.search_hits.load(Ordering::SeqCst), 0);
    assert!(upstreams.report_prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsure_answer_streams_search_backed_report() {
    let upstreams = start(Script {
        gate_body: ndjson(&["<unsure>I need to search for accurate information</unsure>"]),
        report_body: ndjson(&[
            "<think>",
            "Three sources agree.",
            "</think>",
            "\n\nHere is",
            " the news [Source 0].",
        ]),
        ..Default::default()
    })
    .await;

    let response = post_json(
        app(&upstreams, 1),
        "/chat",
        json!({ "message": "  Latest AI news  " }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let lines = stream_lines(response).await;

    let initial = &lines[0];
    assert_eq!(initial["type"], "initial");
    assert_eq!(initial["content"], "Latest AI news");
    let results = initial["searchResults"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["title"], "Source 0");
    assert_eq!(results[0]["domain"], "news0.example.com");
    assert_eq!(
        results[0]["favicon"],
        "https://www.google.com/s2/favicons?domain=news0.example.com"
    );

    assert_eq!(
        lines[1],
        json!({ "type": "thinking", "content": "Three sources agree." })
    );
    let answers: Vec<&str> = lines[2..]
        .iter()
        .map(|l| {
            assert_eq!(l["type"], "answer");
            l["content"].as_str().unwrap()
        })
        .collect();
    assert_eq!(
        answers,
        vec!["\n\nHere is", "\n\nHere is the news [Source 0]."]
    );

    assert_eq!(upstreams.search_hits.load(Ordering::SeqCst), 1);
    let prompts = upstreams.report_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("[Source 0]\nsnippet 0\n\n[Source 1]\nsnippet 1"));
    assert!(prompts[0].contains("Question: Latest AI news"));
}

#[tokio::test]
async fn test_search_outage_closes_stream_without_initial() {
    let upstreams = start(Script {
        gate_body: ndjson(&["<unsure>search please</unsure>"]),
        search_status: StatusCode::SERVICE_UNAVAILABLE,
        search_body: json!({ "detail": "unavailable" }),
        ..Default::default()
    })
    .await;

    let response = post_json(
        app(&upstreams, 0),
        "/chat",
        json!({ "message": "Latest AI news" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "");
    assert_eq!(upstreams.search_hits.load(Ordering::SeqCst), 1);
    assert!(upstreams.report_prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_search_endpoint_reports_outage() {
    let upstreams = start(Script {
        search_status: StatusCode::SERVICE_UNAVAILABLE,
        search_body: json!({}),
        ..Default::default()
    })
    .await;

    let response = post_json(
        app(&upstreams, 0),
        "/search",
        json!({ "query": "Latest AI news" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body, json!({ "error": "Failed to search" }));
}

#[tokio::test]
async fn test_search_outage_is_retried_once() {
    let upstreams = start(Script {
        search_status: StatusCode::SERVICE_UNAVAILABLE,
        search_body: json!({}),
        ..Default::default()
    })
    .await;

    let response = post_json(app(&upstreams, 1), "/api/search", json!({ "query": "q" })).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(upstreams.search_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_search_endpoint_returns_normalized_results() {
    let upstreams = start(Script {
        search_body: json!({
            "results": [
                { "title": "", "content": "no title", "url": "https://a.example.com/1" },
                { "title": "Has domain", "url": "https://b.example.com/2", "domain": "b.example.com" },
                {},
                { "title": "four", "url": "https://d.example.com" },
                { "title": "five", "url": "https://e.example.com" },
            ]
        }),
        ..Default::default()
    })
    .await;

    let response = post_json(app(&upstreams, 0), "/search", json!({ "query": "q" })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    let results = body["searchResults"].as_array().unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(results[0]["title"], "Untitled");
    assert_eq!(results[0]["domain"], "a.example.com");
    assert_eq!(results[1]["domain"], "b.example.com");
    assert_eq!(results[2]["url"], "#");
    assert_eq!(results[2]["content"], "");
    assert_eq!(results[3]["title"], "four");
}

#[tokio::test]
async fn test_malformed_search_payload_is_a_failure() {
    let upstreams = start(Script {
        search_body: json!({ "results": null }),
        ..Default::default()
    })
    .await;

    let response = post_json(app(&upstreams, 1), "/search", json!({ "query": "q" })).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    // format errors are not retried
    assert_eq!(upstreams.search_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_model_backend_failure_before_streaming() {
    let upstreams = start(Script {
        model_status: StatusCode::INTERNAL_SERVER_ERROR,
        ..Default::default()
    })
    .await;

    let response = post_json(app(&upstreams, 0), "/chat", json!({ "message": "hello" })).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body, json!({ "error": "Failed to get response" }));
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let upstreams = start(Script::default()).await;

    let response = post_json(app(&upstreams, 0), "/chat", json!({ "message": "   " })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = post_json(app(&upstreams, 0), "/search", json!({ "query": "" })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_report_lines_are_skipped() {
    let mut report_body = ndjson(&["First"]);
    report_body.push_str("garbage line\n");
    report_body.push_str(&ndjson(&[" and second"]));

    let upstreams = start(Script {
        gate_body: ndjson(&["<unsure>x</unsure>"]),
        report_body,
        ..Default::default()
    })
    .await;

    let response = post_json(app(&upstreams, 0), "/api/chat", json!({ "message": "q" })).await;
    let lines = stream_lines(response).await;

    assert_eq!(lines[0]["type"], "initial");
    assert_eq!(
        lines.last().unwrap(),
        &json!({ "type": "answer", "content": "First and second" })
    );
}

#[tokio::test]
async fn test_gate_cut_mid_stream_ends_chat_without_events() {
    let upstreams = start(Script {
        gate_body: ndjson(&["<confident>Paris is", " the capital"]),
        gate_cut: true,
        ..Default::default()
    })
    .await;

    let response = post_json(
        app(&upstreams, 1),
        "/chat",
        json!({ "message": "What is the capital of France?" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "");
    assert_eq!(upstreams.search_hits.load(Ordering::SeqCst), 0);
}
