use std::time::Duration;

use axum::extract::rejection::BytesRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::validation::ValidationError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("sink unavailable")]
    SinkUnavailable,
}

impl RejectReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            RejectReason::Invalid(err) => err.as_tag(),
            RejectReason::SinkUnavailable => "sink_unavailable",
        }
    }
}

/// The terminal classification of one ingestion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    /// Handed to the sink, the event id is now recorded
    Accepted {
        event_id: String,
        server_time: OffsetDateTime,
    },
    /// Already accepted within the retention window, or being dispatched right now
    Duplicate { event_id: String },
    /// Not retryable as-is
    Rejected(RejectReason),
    /// Admission control refused the signal, retry later
    Throttled { retry_after: Option<Duration> },
}

impl IngestionOutcome {
    pub fn as_tag(&self) -> &'static str {
        match self {
            IngestionOutcome::Accepted { .. } => "accepted",
            IngestionOutcome::Duplicate { .. } => "duplicate",
            IngestionOutcome::Rejected(_) => "rejected",
            IngestionOutcome::Throttled { .. } => "throttled",
        }
    }
}

impl From<ValidationError> for IngestionOutcome {
    fn from(err: ValidationError) -> Self {
        IngestionOutcome::Rejected(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcknowledgementStatus {
    Queued,
    Duplicate,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Acknowledgement {
    pub status: AcknowledgementStatus,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_time: Option<i64>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ThrottledResponse {
    pub error: String,
    pub retry_after: Option<u64>,
}

/// The request body could not be read, usually because it is over the size limit.
#[derive(Debug)]
pub struct BodyRejection(pub BytesRejection);

impl IntoResponse for BodyRejection {
    fn into_response(self) -> Response {
        (
            self.0.status(),
            Json(ErrorResponse {
                error: self.0.body_text(),
            }),
        )
            .into_response()
    }
}

/// Whole seconds to wait, rounded up so that clients never retry too early.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for IngestionOutcome {
    fn into_response(self) -> Response {
        match self {
            IngestionOutcome::Accepted {
                event_id,
                server_time,
            } => (
                StatusCode::ACCEPTED,
                Json(Acknowledgement {
                    status: AcknowledgementStatus::Queued,
                    event_id,
                    server_time: Some(server_time.unix_timestamp()),
                }),
            )
                .into_response(),
            IngestionOutcome::Duplicate { event_id } => (
                StatusCode::OK,
                Json(Acknowledgement {
                    status: AcknowledgementStatus::Duplicate,
                    event_id,
                    server_time: None,
                }),
            )
                .into_response(),
            IngestionOutcome::Rejected(reason) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: reason.to_string(),
                }),
            )
                .into_response(),
            IngestionOutcome::Throttled { retry_after } => {
                let retry_after = retry_after.map(retry_after_secs);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ThrottledResponse {
                        error: "throttled".to_string(),
                        retry_after,
                    }),
                )
                    .into_response();
                if let Some(secs) = retry_after {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                }
                response
            }
        }
    }
}
