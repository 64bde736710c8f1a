use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use tracing::{debug, instrument};

use crate::api::{BodyRejection, IngestionOutcome};
use crate::prometheus::report_dropped_signals;
use crate::router;

/// `POST /signals`: one JSON signal per request.
///
/// The request is handled in full before answering, so the status code tells the client
/// whether the signal was queued. The sink call is bound to a child of the server
/// shutdown token and aborts when the server stops.
#[instrument(
    skip_all,
    fields(
        content_type,
        content_length,
        user_agent
    )
)]
pub async fn signal(
    state: State<router::State>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<IngestionOutcome, BodyRejection> {
    let user_agent = headers
        .get("user-agent")
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));
    let content_type = headers
        .get("content-type")
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));
    tracing::Span::current().record("user_agent", user_agent);
    tracing::Span::current().record("content_type", content_type);

    let body = body.map_err(|err| {
        debug!("could not read signal body: {}", err);
        report_dropped_signals("body_rejected", 1);
        BodyRejection(err)
    })?;
    tracing::Span::current().record("content_length", body.len());
    debug!("received signal request");

    let cancel = state.shutdown.child_token();
    Ok(state.pipeline.ingest(&body, &cancel).await)
}
