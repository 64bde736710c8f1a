#![allow(dead_code)]

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use signal_capture::dispatch::DispatchGate;
use signal_capture::event::SignalPayload;
use signal_capture::health::HealthRegistry;
use signal_capture::idempotency::{IdempotencyGuard, WindowConfig};
use signal_capture::limiters::{AdmissionConfig, AdmissionLimiter};
use signal_capture::pipeline::Pipeline;
use signal_capture::router::{router, RouterOptions};
use signal_capture::sinks::{Sink, SinkError};
use signal_capture::time::TimeSource;
use signal_capture::validation::{Validator, ValidatorConfig};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const NOW: i64 = 1_700_000_000;

#[derive(Clone)]
pub struct FixedTime {
    time: Arc<Mutex<OffsetDateTime>>,
}

impl FixedTime {
    pub fn at(unix: i64) -> Self {
        Self {
            time: Arc::new(Mutex::new(
                OffsetDateTime::from_unix_timestamp(unix).unwrap(),
            )),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.time.lock().unwrap() += by;
    }
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> OffsetDateTime {
        *self.time.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MemorySink {
    signals: Mutex<Vec<SignalPayload>>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MemorySink {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<SignalPayload> {
        self.signals.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn enqueue(&self, signal: &SignalPayload) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("connection refused".to_string()));
        }
        self.signals.lock().unwrap().push(signal.clone());
        Ok(())
    }
}

pub struct TestOptions {
    pub capacity: u32,
    pub refill_rate: f64,
    pub sink_timeout: Duration,
    pub max_body_size: usize,
    pub concurrency_limit: Option<usize>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate: 10.0,
            sink_timeout: Duration::from_secs(2),
            max_body_size: 1_000_000,
            concurrency_limit: None,
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub sink: Arc<MemorySink>,
    pub time: FixedTime,
    pub liveness: HealthRegistry,
    pub guard: IdempotencyGuard,
    pub shutdown: CancellationToken,
}

impl TestApp {
    pub fn new(options: TestOptions) -> Self {
        let sink = Arc::new(MemorySink::default());
        let time = FixedTime::at(NOW);
        let liveness = HealthRegistry::new("liveness");
        let shutdown = CancellationToken::new();

        let limiter = AdmissionLimiter::new(AdmissionConfig {
            capacity: NonZeroU32::new(options.capacity).unwrap(),
            refill_rate: options.refill_rate,
        })
        .unwrap();
        let guard = IdempotencyGuard::new(WindowConfig::default());
        let pipeline = Pipeline::new(
            Validator::new(ValidatorConfig::default()),
            guard.clone(),
            DispatchGate::new(limiter, sink.clone(), options.sink_timeout),
            Arc::new(time.clone()),
        );

        let router = router(
            pipeline,
            liveness.clone(),
            shutdown.clone(),
            RouterOptions {
                max_body_size: options.max_body_size,
                concurrency_limit: options.concurrency_limit,
                metrics: false,
            },
        );

        Self {
            router,
            sink,
            time,
            liveness,
            guard,
            shutdown,
        }
    }

    pub async fn post_signal(&self, body: impl Into<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::post("/signals")
                    .header("content-type", "application/json")
                    .body(body.into())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, headers, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, String) {
        let response = self
            .router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }
}

pub fn signal(event_id: &str, occurred_at: i64) -> Value {
    json!({
        "event_id": event_id,
        "actor": {"id": "user-42", "type": "user"},
        "subject": {"id": "post-7", "type": "post"},
        "signal": {"name": "like", "value": 1.0},
        "occurred_at": occurred_at,
    })
}
