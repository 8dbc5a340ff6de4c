//! Integration test: serve NDJSON from a local axum server and read it through HttpTransport.
//! Does not need a real generation backend. Server tasks are left running when tests end.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spacechat_core::config::GenerationConfig;
use spacechat_core::context::SpaceContext;
use spacechat_core::conversation::ErrorKind;
use spacechat_core::stream::{
    GenerationRequest, HttpTransport, SessionEnd, StreamError, StreamHandler, StreamSession,
};
use spacechat_core::thread::{ContentBlock, ToolUse};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(String, Option<String>, serde_json::Value)>>>,
}

fn record(seen: &Seen, path: &str, headers: &HeaderMap, body: serde_json::Value) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    seen.requests
        .lock()
        .expect("lock")
        .push((path.to_string(), auth, body));
}

async fn chat_stream(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    record(&seen, "chat", &headers, body);
    // Split records across chunk boundaries.
    let chunks = vec![
        "{\"type\":\"message_start\"}\n{\"type\":\"text\",\"con".to_string(),
        "tent\":\"Hello\"}\n{\"type\":\"text\",\"content\":\" there\"}\n".to_string(),
        "{\"type\":\"done\",\"conversation_title\":\"Hi\"}\n".to_string(),
    ];
    let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<String, Infallible>));
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .expect("response")
}

async fn tool_output(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    record(&seen, "tool", &headers, body);
    "{\"type\":\"tool_use\",\"content\":{\"id\":\"toolu_2\",\"name\":\"notes_append\",\"input\":{\"text\":\"x\"}}}\n"
}

async fn rate_limited() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({ "error": { "message": "Rate limit reached for requests" } })),
    )
}

async fn broken() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded")
}

async fn endless() -> Response {
    let head = futures_util::stream::iter(vec![Ok::<String, Infallible>(
        "{\"type\":\"text\",\"content\":\"still going\"}\n".to_string(),
    )]);
    let body = futures_util::StreamExt::chain(head, futures_util::stream::pending());
    Response::builder()
        .body(Body::from_stream(body))
        .expect("response")
}

async fn start_server(seen: Seen) -> String {
    let app = Router::new()
        .route("/claude/chat/stream", post(chat_stream))
        .route("/claude/tool-output", post(tool_output))
        .route("/limited/chat/stream", post(rate_limited))
        .route("/broken/chat/stream", post(broken))
        .route("/endless/chat/stream", post(endless))
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn transport(base_url: &str, prefix: &str) -> HttpTransport {
    let config = GenerationConfig {
        base_url: base_url.to_string(),
        chat_stream_path: format!("{}/chat/stream", prefix),
        tool_output_path: format!("{}/tool-output", prefix),
        ..GenerationConfig::default()
    };
    HttpTransport::new(&config, Some("secret-token".to_string())).expect("client")
}

#[derive(Default)]
struct Recorder {
    full: String,
    done_title: Option<String>,
    done: bool,
    tools: Vec<ToolUse>,
    errors: Vec<String>,
    kinds: Vec<ErrorKind>,
}

#[async_trait]
impl StreamHandler for Recorder {
    async fn on_text(&mut self, _delta: &str, full: &str) {
        self.full = full.to_string();
    }
    async fn on_tool_use(&mut self, tool_use: ToolUse) {
        self.tools.push(tool_use);
    }
    async fn on_done(&mut self, full: &str, title: Option<String>) {
        self.full = full.to_string();
        self.done_title = title;
        self.done = true;
    }
    async fn on_error(&mut self, error: StreamError) {
        self.kinds.push(ErrorKind::from_stream_error(&error));
        self.errors.push(error.to_string());
    }
}

fn query(text: &str) -> GenerationRequest {
    GenerationRequest::for_block(
        &ContentBlock::text(text),
        SpaceContext::new("space-1"),
        vec![],
        vec![],
        "test-model",
    )
    .expect("text request")
}

#[tokio::test]
async fn streams_ndjson_over_http() {
    let seen = Seen::default();
    let base = start_server(seen.clone()).await;
    let transport = transport(&base, "/claude");

    let mut rec = Recorder::default();
    let end = StreamSession::new(CancellationToken::new())
        .open_and_run(&transport, &query("hello?"), &mut rec)
        .await;
    assert_eq!(end, SessionEnd::Done);
    assert!(rec.done);
    assert_eq!(rec.full, "Hello there");
    assert_eq!(rec.done_title.as_deref(), Some("Hi"));

    let requests = seen.requests.lock().expect("lock");
    let (path, auth, body) = &requests[0];
    assert_eq!(path, "chat");
    assert_eq!(auth.as_deref(), Some("Bearer secret-token"));
    assert_eq!(body["query"], "hello?");
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["context"]["spaceId"], "space-1");
}

#[tokio::test]
async fn tool_result_goes_to_tool_output_path() {
    let seen = Seen::default();
    let base = start_server(seen.clone()).await;
    let transport = transport(&base, "/claude");
    let request = GenerationRequest::for_block(
        &ContentBlock::tool_result("toolu_1", "{\"status\":\"success\"}"),
        SpaceContext::new("space-1"),
        vec![],
        vec![],
        "test-model",
    )
    .expect("tool result request");

    let mut rec = Recorder::default();
    let end = StreamSession::new(CancellationToken::new())
        .open_and_run(&transport, &request, &mut rec)
        .await;
    assert_eq!(end, SessionEnd::ToolUse);
    assert_eq!(rec.tools[0].id, "toolu_2");

    let requests = seen.requests.lock().expect("lock");
    assert_eq!(requests[0].0, "tool");
    assert_eq!(requests[0].2["tool_use_id"], "toolu_1");
    assert_eq!(requests[0].2["stream"], true);
}

#[tokio::test]
async fn non_success_status_reports_server_message() {
    let base = start_server(Seen::default()).await;

    let mut rec = Recorder::default();
    let end = StreamSession::new(CancellationToken::new())
        .open_and_run(&transport(&base, "/limited"), &query("x"), &mut rec)
        .await;
    assert_eq!(end, SessionEnd::Error);
    assert_eq!(rec.errors, vec!["Rate limit reached for requests".to_string()]);

    let mut rec = Recorder::default();
    let end = StreamSession::new(CancellationToken::new())
        .open_and_run(&transport(&base, "/broken"), &query("x"), &mut rec)
        .await;
    assert_eq!(end, SessionEnd::Error);
    assert!(rec.errors[0].starts_with("Failed to process query"));
    assert!(rec.errors[0].contains("500"));
}

#[tokio::test]
async fn cancel_closes_open_stream() {
    let base = start_server(Seen::default()).await;
    let transport = transport(&base, "/endless");
    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };

    let mut rec = Recorder::default();
    let mut session = StreamSession::new(cancel);
    let end = tokio::time::timeout(
        Duration::from_secs(5),
        session.open_and_run(&transport, &query("x"), &mut rec),
    )
    .await
    .expect("stream should stop once cancelled");
    stopper.await.expect("stopper");
    assert_eq!(end, SessionEnd::Cancelled);
    assert_eq!(session.full_text(), "still going");
    assert!(rec.errors.is_empty());
}

#[tokio::test]
async fn silent_server_is_reported_as_timeout() {
    // Accepts connections and never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let config = GenerationConfig {
        base_url: format!("http://{}", addr),
        read_timeout_secs: 1,
        ..GenerationConfig::default()
    };
    let transport = HttpTransport::new(&config, None).expect("client");
    let mut rec = Recorder::default();
    let end = tokio::time::timeout(
        Duration::from_secs(10),
        StreamSession::new(CancellationToken::new()).open_and_run(&transport, &query("x"), &mut rec),
    )
    .await
    .expect("read timeout should end the request");
    assert_eq!(end, SessionEnd::Error);
    assert_eq!(rec.kinds, vec![ErrorKind::Timeout]);
    assert!(ErrorKind::Timeout.user_message().contains("took too long"));
}
