#[path = "common/mod.rs"]
mod common;

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use bytes::Bytes;
use chat_guard::collaborators::{
    ChatMessage, CompletionProvider, OpenAiStreamProvider, ProviderConfig, ProviderError, StreamChunk,
};
use chat_guard::{app, AppState};
use common::{body_string, chat_request, components};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
    ": keep-alive\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Você tem \"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"2 entrevistas.\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
);

async fn completions(Json(req): Json<Value>) -> Response {
    if req["stream"] != json!(true) || req["model"] != json!("test-model") {
        return (StatusCode::BAD_REQUEST, "expected a streaming request").into_response();
    }
    if req["messages"].as_array().map_or(true, |m| m.is_empty()) {
        return (StatusCode::BAD_REQUEST, "no messages").into_response();
    }
    ([(header::CONTENT_TYPE, "text/event-stream")], SSE_BODY).into_response()
}

async fn overloaded() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response()
}

async fn serve(router: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/v1", addr), handle)
}

fn provider(base_url: String) -> OpenAiStreamProvider {
    OpenAiStreamProvider::new(ProviderConfig {
        base_url,
        api_key: Some("sk-test".into()),
        model: "test-model".into(),
        max_tokens: 64,
        request_timeout_secs: 5,
        connect_timeout_secs: 2,
    })
    .unwrap()
}

#[tokio::test]
async fn decodes_openai_event_stream() {
    let (base, handle) = serve(Router::new().route("/v1/chat/completions", post(completions))).await;
    let mut rx = provider(base).stream_completion(vec![ChatMessage::user("Quantas entrevistas?")]);

    let mut chunks = Vec::new();
    while let Some(item) = rx.recv().await {
        chunks.push(item.unwrap());
    }
    assert_eq!(
        chunks,
        vec![
            StreamChunk::delta("Você tem "),
            StreamChunk::delta("2 entrevistas."),
            StreamChunk::last(""),
        ]
    );
    handle.abort();
}

#[tokio::test]
async fn non_success_status_is_an_error_item() {
    let (base, handle) = serve(Router::new().route("/v1/chat/completions", post(overloaded))).await;
    let mut rx = provider(base).stream_completion(vec![ChatMessage::user("oi")]);
    match rx.recv().await {
        Some(Err(ProviderError::Status { status, body })) => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected item: {other:?}"),
    }
    assert!(rx.recv().await.is_none());
    handle.abort();
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_receiver_releases_upstream_connection() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let flag = flag.clone();
            async move {
                let guard = DropFlag(flag);
                let events = futures_util::stream::unfold(guard, |guard| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let line = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"},\"finish_reason\":null}]}\n\n";
                    Some((Ok::<_, Infallible>(Bytes::from(line)), guard))
                });
                ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(events))
            }
        }),
    );
    let (base, handle) = serve(router).await;

    let mut rx = provider(base).stream_completion(vec![ChatMessage::user("oi")]);
    let first = rx.recv().await.unwrap().unwrap();
    assert_eq!(first, StreamChunk::delta("x"));
    drop(rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !released.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "upstream stream still open after consumer dropped"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.abort();
}

#[tokio::test]
async fn end_to_end_chat_over_openai_adapter() {
    let (base, handle) = serve(Router::new().route("/v1/chat/completions", post(completions))).await;
    let state = AppState::new(components(Arc::new(provider(base))));
    let resp = app(state)
        .oneshot(chat_request("Quantas entrevistas eu tenho marcadas?"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp.into_body()).await, "Você tem 2 entrevistas.");
    handle.abort();
}
