//! Local stand-in for an OpenAI-compatible server. The first path segment selects the
//! behavior, e.g. `http://127.0.0.1:<port>/ok/v1/chat/completions`.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOPIC_REPLY: &str = "\"Crab Talk.\"";

#[derive(Clone, Default)]
pub struct MockState {
    /// Bodies of every chat completion request, in arrival order.
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl MockState {
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_streaming_request(&self) -> Option<Value> {
        self.requests()
            .into_iter()
            .rev()
            .find(|b| b["stream"].as_bool() == Some(true))
    }
}

pub struct MockServer {
    pub port: u16,
    pub state: MockState,
}

impl MockServer {
    /// Base URL for a behavior mode.
    pub fn base(&self, mode: &str) -> String {
        format!("http://127.0.0.1:{}/{}", self.port, mode)
    }
}

pub async fn start() -> MockServer {
    let state = MockState::default();
    let app = Router::new()
        .route("/:mode/v1/chat/completions", post(completions))
        .route("/:mode/v1/images/generations", post(images))
        .route("/:mode/api/web-search", get(web_search))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let port = listener.local_addr().expect("local_addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockServer { port, state }
}

pub fn frame(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

fn sse(chunks: Vec<String>) -> Response {
    let stream = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<_, Infallible>(Bytes::from(c))),
    );
    event_stream(Body::from_stream(stream))
}

fn event_stream(body: Body) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .expect("build response")
}

/// Frames spaced `delay` apart; `forever` keeps sending instead of ending with [DONE].
fn paced(delay: Duration, count: Option<u32>) -> Response {
    let stream = futures_util::stream::unfold(0u32, move |i| async move {
        if count.map_or(false, |c| i > c) {
            return None;
        }
        tokio::time::sleep(delay).await;
        let chunk = if count == Some(i) {
            "data: [DONE]\n\n".to_string()
        } else {
            frame("x")
        };
        Some((Ok::<_, Infallible>(Bytes::from(chunk)), i + 1))
    });
    event_stream(Body::from_stream(stream))
}

async fn completions(
    Path(mode): Path<String>,
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.requests.lock().unwrap().push(body.clone());
    let stream = body["stream"].as_bool().unwrap_or(false);
    match mode.as_str() {
        "unauthorized" => (StatusCode::UNAUTHORIZED, "invalid api key").into_response(),
        "error" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        "auth" => {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if auth == "Bearer nk-letmein" {
                Json(json!({ "choices": [{ "message": { "content": "welcome" } }] })).into_response()
            } else {
                (StatusCode::UNAUTHORIZED, "no").into_response()
            }
        }
        "garbage" => "this is not json".into_response(),
        "nodone" => sse(vec![frame("par"), frame("tial")]),
        "stall" => {
            let first = futures_util::stream::iter(vec![Ok::<_, Infallible>(Bytes::from(frame("waiting")))]);
            let body = first.chain(futures_util::stream::pending());
            event_stream(Body::from_stream(body))
        }
        "late" => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            sse(vec![frame("too late"), "data: [DONE]\n\n".to_string()])
        }
        "slow" => paced(Duration::from_millis(20), None),
        "slowok" => paced(Duration::from_millis(60), Some(5)),
        _ if !stream => {
            Json(json!({ "choices": [{ "message": { "role": "assistant", "content": TOPIC_REPLY } }] }))
                .into_response()
        }
        _ => {
            // "Hello" split mid-frame and mid-line across chunks.
            let all = format!("{}{}data: [DONE]\n\n", frame("He"), frame("llo"));
            let (a, rest) = all.split_at(17);
            let (b, c) = rest.split_at(40);
            sse(vec![a.to_string(), b.to_string(), c.to_string()])
        }
    }
}

async fn images(Path(mode): Path<String>, Json(body): Json<Value>) -> Response {
    if mode == "error" {
        return (StatusCode::BAD_REQUEST, "bad size").into_response();
    }
    Json(json!({
        "created": 1,
        "data": [{ "url": format!("https://img.example/{}.png", body["size"].as_str().unwrap_or("?")) }]
    }))
    .into_response()
}

async fn web_search(Path(mode): Path<String>, Query(q): Query<HashMap<String, String>>) -> Response {
    if mode == "error" {
        return (StatusCode::BAD_GATEWAY, "search down").into_response();
    }
    let query = q.get("query").cloned().unwrap_or_default();
    Json(json!({
        "items": [{ "title": format!("About {}", query), "formattedUrl": "example.org", "snippet": "found it" }]
    }))
    .into_response()
}
