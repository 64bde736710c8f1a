use async_trait::async_trait;

use metrics::counter;
use tracing::info;

use crate::event::SignalPayload;
use crate::prometheus::SIGNALS_INGESTED_TOTAL;
use crate::sinks::{Sink, SinkError};

/// Logs every signal instead of queueing it. Only meant for local debugging.
pub struct PrintSink {}

#[async_trait]
impl Sink for PrintSink {
    async fn enqueue(&self, signal: &SignalPayload) -> Result<(), SinkError> {
        info!(
            event_id = signal.event_id(),
            actor = signal.actor().id(),
            actor_type = signal.actor().kind(),
            subject = signal.subject().id(),
            subject_type = signal.subject().kind(),
            signal = signal.signal().name(),
            value = signal.signal().value(),
            occurred_at = signal.occurred_at(),
            "received signal"
        );
        counter!(SIGNALS_INGESTED_TOTAL).increment(1);

        Ok(())
    }
}
