use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::capture;
use crate::health::HealthRegistry;
use crate::pipeline::Pipeline;
use crate::prometheus::{setup_metrics_recorder, track_metrics};

#[derive(Clone)]
pub struct State {
    pub pipeline: Arc<Pipeline>,
    pub shutdown: CancellationToken,
}

async fn index() -> &'static str {
    "signal-capture"
}

pub struct RouterOptions {
    pub max_body_size: usize,
    pub concurrency_limit: Option<usize>,
    pub metrics: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            max_body_size: 1_000_000,
            concurrency_limit: None,
            metrics: false,
        }
    }
}

pub fn router(
    pipeline: Pipeline,
    liveness: HealthRegistry,
    shutdown: CancellationToken,
    options: RouterOptions,
) -> Router {
    let state = State {
        pipeline: Arc::new(pipeline),
        shutdown,
    };

    let signals = match options.concurrency_limit {
        Some(limit) => post(capture::signal)
            .layer::<_, Infallible>(ConcurrencyLimitLayer::new(limit))
            .layer(DefaultBodyLimit::max(options.max_body_size)),
        None => post(capture::signal).layer(DefaultBodyLimit::max(options.max_body_size)),
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/signals", signals)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if options.metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
