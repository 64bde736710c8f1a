use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{IngestionOutcome, RejectReason};
use crate::event::SignalPayload;
use crate::limiters::{Admission, AdmissionLimiter};
use crate::prometheus::{report_dropped_signals, SINK_DURATION_SECONDS};
use crate::sinks::{Sink, SinkError};

/// Last stage before the sink: takes an admission token, then enqueues the signal
/// with a bounded wait.
#[derive(Clone)]
pub struct DispatchGate {
    limiter: AdmissionLimiter,
    sink: Arc<dyn Sink + Send + Sync>,
    sink_timeout: Duration,
}

impl DispatchGate {
    pub fn new(
        limiter: AdmissionLimiter,
        sink: Arc<dyn Sink + Send + Sync>,
        sink_timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            sink,
            sink_timeout,
        }
    }

    /// Never retries: a sink failure, a timeout or a cancellation is reported as
    /// `Rejected(SinkUnavailable)` and the client decides whether to try again.
    ///
    /// `received_at` is echoed back as the server time of an accepted signal.
    pub async fn dispatch(
        &self,
        payload: &SignalPayload,
        received_at: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> IngestionOutcome {
        if let Admission::Throttled { retry_after } = self.limiter.try_acquire() {
            report_dropped_signals("throttled", 1);
            return IngestionOutcome::Throttled { retry_after };
        }

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SinkError::Cancelled),
            res = tokio::time::timeout(self.sink_timeout, self.sink.enqueue(payload)) => {
                res.unwrap_or(Err(SinkError::Timeout))
            }
        };
        histogram!(SINK_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => IngestionOutcome::Accepted {
                event_id: payload.event_id().to_owned(),
                server_time: received_at,
            },
            Err(err) => {
                warn!(
                    event_id = payload.event_id(),
                    "failed to enqueue signal: {}", err
                );
                report_dropped_signals(err.as_tag(), 1);
                IngestionOutcome::Rejected(RejectReason::SinkUnavailable)
            }
        }
    }
}
