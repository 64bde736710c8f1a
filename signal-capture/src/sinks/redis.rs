use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::event::SignalPayload;
use crate::health::{ComponentStatus, HealthHandle};
use crate::prometheus::SIGNALS_INGESTED_TOTAL;
use crate::sinks::{Sink, SinkError};

const LIVENESS_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Pushes serialized signals onto a Redis list, consumers pop them from the other end.
#[derive(Clone)]
pub struct RedisSink {
    connection: MultiplexedConnection,
    queue_key: String,
}

impl RedisSink {
    /// Connects to Redis and checks the connection with a PING.
    ///
    /// A `None` timeout waits forever, `Duration::ZERO` is refused.
    pub async fn new(
        url: &str,
        queue_key: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> anyhow::Result<RedisSink> {
        info!("connecting to Redis at {}...", url);

        if response_timeout.is_some_and(|t| t.is_zero())
            || connection_timeout.is_some_and(|t| t.is_zero())
        {
            anyhow::bail!("Redis timeouts cannot be zero, leave them unset to disable them");
        }

        let client = redis::Client::open(url)?;

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let mut connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        // Ping the server to make sure we can reach it before accepting traffic
        let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
        debug!("Redis answered {}", pong);
        info!("connected to Redis, queueing signals on {}", queue_key);

        Ok(RedisSink {
            connection,
            queue_key,
        })
    }

    /// Reports liveness while Redis answers PINGs, needs to be spawned in a separate task.
    pub async fn report_liveness(&self, liveness: HealthHandle, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(LIVENESS_PING_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let mut connection = self.connection.clone();
            let res: Result<String, RedisError> =
                redis::cmd("PING").query_async(&mut connection).await;
            match res {
                Ok(_) => liveness.report_healthy(),
                Err(err) => {
                    error!("failed to ping Redis: {}", err);
                    liveness.report_status(ComponentStatus::Unhealthy);
                }
            }
        }
    }
}

fn sink_error(err: RedisError) -> SinkError {
    if err.is_timeout() {
        SinkError::Timeout
    } else {
        error!("failed to push signal to Redis: {}", err);
        SinkError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl Sink for RedisSink {
    #[instrument(skip_all, fields(event_id = signal.event_id()))]
    async fn enqueue(&self, signal: &SignalPayload) -> Result<(), SinkError> {
        let data = serde_json::to_string(signal)?;

        let mut connection = self.connection.clone();
        let queue_len: i64 = connection
            .rpush(self.queue_key.as_str(), data)
            .await
            .map_err(sink_error)?;

        debug!(queue_len, "signal queued");
        counter!(SIGNALS_INGESTED_TOTAL).increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn timeouts_are_told_apart() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        assert!(matches!(sink_error(err), SinkError::Timeout));

        let err = RedisError::from((redis::ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(matches!(sink_error(err), SinkError::Unavailable(_)));
    }

    #[tokio::test]
    async fn zero_timeouts_are_refused() {
        let res = RedisSink::new(
            "redis://localhost:6379/",
            "signals".to_string(),
            Some(Duration::ZERO),
            None,
        )
        .await;
        assert!(res.is_err());
    }
}
