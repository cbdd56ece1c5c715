//! Test harness for the HTTP surface.
//!
//! Each harness owns a fresh in-process broker, a recording transport for the
//! dispatcher, a switchable liveness probe, and the full axum router. The
//! retry schedule is shortened so exhaustion takes milliseconds.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use courier::testing::{StaticProbe, TestTransport};
use courier::{DispatchConfig, Dispatcher, InMemoryBroker, Record, RetryPolicy};
use serde_json::Value;
use server_core::kernel::AuditProcessor;
use server_core::server::build_app;
use test_context::AsyncTestContext;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Attempts per dispatch in tests.
pub const TEST_MAX_ATTEMPTS: u32 = 3;

/// Interval between attempts in tests.
pub const TEST_RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub struct TestHarness {
    pub broker: InMemoryBroker,
    pub transport: Arc<TestTransport>,
    pub probe: Arc<StaticProbe>,
    pub dispatcher: Dispatcher,
    pub app: Router,
    processor: Option<JoinHandle<()>>,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new()
    }

    async fn teardown(self) {
        if let Some(processor) = self.processor {
            processor.abort();
        }
    }
}

impl TestHarness {
    pub fn new() -> Self {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let broker = InMemoryBroker::new();
        let transport = Arc::new(TestTransport::new(&broker));
        let probe = Arc::new(StaticProbe::new(true));
        let dispatcher = Dispatcher::builder(transport.clone())
            .with_probe(probe.clone())
            .with_config(DispatchConfig {
                retry: RetryPolicy::new(TEST_MAX_ATTEMPTS, TEST_RETRY_INTERVAL),
                ..DispatchConfig::default()
            })
            .build();
        let app = build_app(dispatcher.clone());

        Self {
            broker,
            transport,
            probe,
            dispatcher,
            app,
            processor: None,
        }
    }

    /// Start the embedded audit processor on its own connection.
    pub async fn start_processor(&mut self) {
        let processor = AuditProcessor::new(
            Arc::new(self.broker.connect()),
            self.dispatcher.config().audit_topic.clone(),
        )
        .spawn()
        .await
        .expect("Failed to start audit processor");
        self.processor = Some(processor);
    }

    /// Commit a record directly, bypassing the bus.
    pub fn seed_record(&self, record_id: &str) {
        self.dispatcher.records().upsert(
            record_id,
            Record {
                record_id: record_id.to_string(),
                user_id: "user-1".into(),
                org: "org-1".into(),
                emission_gas_name: "CO2".into(),
                quantity: 1.0,
                unit: "kg".into(),
            },
        );
    }

    /// POST a raw body to `/record`.
    pub async fn post_record(&self, body: impl Into<Body>) -> (StatusCode, Value) {
        self.send(record_request(body)).await
    }

    /// POST a JSON value to `/record` on a background task; resolves to the
    /// response status.
    pub fn spawn_post_json(&self, value: &Value) -> JoinHandle<StatusCode> {
        let app = self.app.clone();
        let request = record_request(value.to_string());
        tokio::spawn(async move {
            app.oneshot(request)
                .await
                .expect("Router is infallible")
                .status()
        })
    }

    /// POST a JSON value to `/record`.
    pub async fn post_json(&self, value: &Value) -> (StatusCode, Value) {
        self.post_record(value.to_string()).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read response body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("Response body is not JSON")
        };
        (status, body)
    }

    /// Wait until `n` dispatches are pending.
    pub async fn wait_for_in_flight(&self, n: usize) {
        for _ in 0..200 {
            if self.dispatcher.in_flight() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "expected {n} dispatches in flight, found {}",
            self.dispatcher.in_flight()
        );
    }
}

fn record_request(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/record")
        .header(CONTENT_TYPE, "application/json")
        .body(body.into())
        .expect("Failed to build request")
}
