use async_trait::async_trait;
use thiserror::Error;

use crate::event::SignalPayload;

pub mod print;
pub mod redis;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("failed to serialize signal: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sink did not answer in time")]
    Timeout,
    #[error("sink call cancelled")]
    Cancelled,
}

impl SinkError {
    pub fn as_tag(&self) -> &'static str {
        match self {
            SinkError::Unavailable(_) => "sink_unavailable",
            SinkError::Serialization(_) => "sink_serialization",
            SinkError::Timeout => "sink_timeout",
            SinkError::Cancelled => "sink_cancelled",
        }
    }
}

/// The downstream queue validated signals are handed to.
///
/// Implementations should not retry internally: a failed enqueue is reported to the
/// client, which owns the retry decision.
#[async_trait]
pub trait Sink {
    async fn enqueue(&self, signal: &SignalPayload) -> Result<(), SinkError>;
}
