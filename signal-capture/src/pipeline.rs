use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, Span};

use crate::api::IngestionOutcome;
use crate::dispatch::DispatchGate;
use crate::idempotency::IdempotencyGuard;
use crate::prometheus::{report_dropped_signals, report_outcome, SIGNALS_RECEIVED_TOTAL};
use crate::time::TimeSource;
use crate::validation::Validator;

/// Runs one inbound signal through validation, deduplication and dispatch.
///
/// Every stage can end the run early, and every input yields exactly one outcome.
/// The idempotency window and the admission limiter are owned by the pipeline, so two
/// pipelines never share state.
#[derive(Clone)]
pub struct Pipeline {
    validator: Validator,
    guard: IdempotencyGuard,
    gate: DispatchGate,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl Pipeline {
    pub fn new(
        validator: Validator,
        guard: IdempotencyGuard,
        gate: DispatchGate,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            validator,
            guard,
            gate,
            timesource,
        }
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    #[instrument(skip_all, fields(event_id, outcome))]
    pub async fn ingest(&self, raw: &[u8], cancel: &CancellationToken) -> IngestionOutcome {
        counter!(SIGNALS_RECEIVED_TOTAL).increment(1);
        let outcome = self.run(raw, cancel).await;

        Span::current().record("outcome", outcome.as_tag());
        report_outcome(&outcome);
        outcome
    }

    async fn run(&self, raw: &[u8], cancel: &CancellationToken) -> IngestionOutcome {
        let now = self.timesource.current_time();

        let payload = match self.validator.validate(raw, now) {
            Ok(payload) => payload,
            Err(err) => {
                debug!("rejected signal: {}", err);
                report_dropped_signals(err.as_tag(), 1);
                return err.into();
            }
        };
        Span::current().record("event_id", payload.event_id());

        let Ok(reservation) = self.guard.check_and_reserve(payload.event_id(), now) else {
            return IngestionOutcome::Duplicate {
                event_id: payload.event_id().to_owned(),
            };
        };

        let outcome = self.gate.dispatch(&payload, now, cancel).await;
        if let IngestionOutcome::Accepted { .. } = outcome {
            reservation.commit();
        }
        // any other outcome drops the reservation, a retry of the same id can go through
        outcome
    }
}
