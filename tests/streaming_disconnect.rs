#[path = "common/mod.rs"]
mod common;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chat_guard::app;
use common::{test_state, EndlessProvider};
use reqwest::Client;
use tokio::net::TcpListener;

// Caller hangs up mid-answer: the provider task must observe it and stop.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caller_disconnect_stops_provider() {
    let provider = Arc::new(EndlessProvider::new());
    let stopped = provider.stopped.clone();
    let sent = provider.sent.clone();
    let state = test_state(provider);
    let metrics = state.metrics.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    let server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    let mut resp = Client::new()
        .post(format!("http://{}/chat", addr))
        .json(&serde_json::json!({ "message": "Quantas candidaturas eu enviei este mês?" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let first = resp.chunk().await.unwrap().expect("first chunk");
    assert!(!first.is_empty());
    drop(resp);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !stopped.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "provider kept producing after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    while metrics.streams_cancelled_total.load(Ordering::Relaxed) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "stream never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Nothing is produced or relayed once the stream is torn down.
    let sent_after = sent.load(Ordering::SeqCst);
    let relayed_after = metrics.chunks_relayed_total.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sent.load(Ordering::SeqCst), sent_after);
    assert_eq!(metrics.chunks_relayed_total.load(Ordering::Relaxed), relayed_after);
    assert_eq!(metrics.streams_completed_total.load(Ordering::Relaxed), 0);
    assert_eq!(metrics.streams_failed_total.load(Ordering::Relaxed), 0);

    server.abort();
}
