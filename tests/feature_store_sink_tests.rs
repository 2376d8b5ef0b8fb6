use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use candle_pipeline::error::SinkError;
use candle_pipeline::model::candle::Candle;
use candle_pipeline::sink::{CandleSink, FeatureStoreSink};

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<(Option<String>, Value)>>,
    attempts: Mutex<Vec<Option<String>>>,
    status: AtomicU16,
}

impl Recorder {
    fn batches(&self) -> Vec<(Option<String>, Value)> {
        self.batches.lock().unwrap().clone()
    }

    fn attempt_keys(&self) -> Vec<Option<String>> {
        self.attempts.lock().unwrap().clone()
    }
}

async fn rows(
    State(recorder): State<Arc<Recorder>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    recorder.attempts.lock().unwrap().push(key.clone());

    let status = StatusCode::from_u16(recorder.status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::OK);
    if status.is_success() {
        recorder.batches.lock().unwrap().push((key, body));
    }
    status
}

async fn spawn_store() -> (String, Arc<Recorder>) {
    let recorder = Arc::new(Recorder {
        status: AtomicU16::new(200),
        ..Recorder::default()
    });
    let app = Router::new()
        .route("/rows", post(rows))
        .with_state(recorder.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}/rows", addr), recorder)
}

fn candle(start: i64, close: f64) -> Candle {
    Candle {
        product_id: "BTC/USD".to_string(),
        open: 100.0,
        high: close.max(100.0),
        low: close.min(100.0),
        close,
        volume: 1.5,
        trades: 3,
        window_start_ms: start,
        window_end_ms: start + 60_000,
    }
}

#[tokio::test]
/// Verifies rows are buffered until `buffer_size` is reached and pushed as
/// one batch carrying the feature-group metadata.
async fn buffers_until_batch_is_full() {
    let (url, recorder) = spawn_store().await;
    let mut sink = FeatureStoreSink::new(&url, "ohlc", 2, 3);

    sink.accept(&candle(0, 101.0)).await.unwrap();
    sink.accept(&candle(60_000, 102.0)).await.unwrap();
    assert_eq!(sink.buffered(), 2);
    assert!(recorder.batches().is_empty());

    sink.accept(&candle(120_000, 99.0)).await.unwrap();
    assert_eq!(sink.buffered(), 0);

    let batches = recorder.batches();
    assert_eq!(batches.len(), 1);
    let (key, body) = &batches[0];
    assert!(key.is_some());
    assert_eq!(body["feature_group"], "ohlc");
    assert_eq!(body["version"], 2);
    assert_eq!(body["primary_key"][0], "product_id");
    assert_eq!(body["primary_key"][1], "timestamp");
    assert_eq!(body["event_time"], "timestamp");

    let rows = body["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["timestamp"], 0);
    assert_eq!(rows[2]["timestamp"], 120_000);
    assert_eq!(rows[2]["close"], 99.0);
    assert_eq!(rows[1]["product_id"], "BTC/USD");
}

#[tokio::test]
async fn flush_pushes_partial_batch() {
    let (url, recorder) = spawn_store().await;
    let mut sink = FeatureStoreSink::new(&url, "ohlc", 1, 10);

    sink.flush().await.unwrap();
    assert!(recorder.attempt_keys().is_empty(), "empty flush sends nothing");

    sink.accept(&candle(0, 101.0)).await.unwrap();
    sink.flush().await.unwrap();
    assert_eq!(sink.buffered(), 0);

    let batches = recorder.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1["rows"].as_array().unwrap().len(), 1);
}

#[tokio::test]
/// Verifies a rejected push keeps the rows buffered and a retry of the same
/// batch reuses its idempotency key.
async fn rejected_push_keeps_rows_and_key_for_retry() {
    let (url, recorder) = spawn_store().await;
    let mut sink = FeatureStoreSink::new(&url, "ohlc", 1, 2);

    sink.accept(&candle(0, 101.0)).await.unwrap();
    recorder.status.store(503, Ordering::SeqCst);

    let err = sink.accept(&candle(60_000, 102.0)).await.unwrap_err();
    assert!(matches!(err, SinkError::Rejected { status: 503, .. }));
    assert_eq!(sink.buffered(), 1, "failed candle must not stay buffered");

    recorder.status.store(200, Ordering::SeqCst);
    sink.accept(&candle(60_000, 102.0)).await.unwrap();
    assert_eq!(sink.buffered(), 0);

    let attempts = recorder.attempt_keys();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], attempts[1]);

    let batches = recorder.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1["rows"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unreachable_store_is_an_http_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut sink = FeatureStoreSink::new(&format!("http://{}/rows", addr), "ohlc", 1, 1);
    let err = sink.accept(&candle(0, 101.0)).await.unwrap_err();
    assert!(matches!(err, SinkError::Http(_)));
    assert_eq!(sink.buffered(), 0);
}
