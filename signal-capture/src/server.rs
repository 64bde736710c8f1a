use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::dispatch::DispatchGate;
use crate::health::{ComponentStatus, HealthRegistry};
use crate::idempotency::IdempotencyGuard;
use crate::limiters::AdmissionLimiter;
use crate::pipeline::Pipeline;
use crate::router::{self, RouterOptions};
use crate::sinks::print::PrintSink;
use crate::sinks::redis::RedisSink;
use crate::sinks::Sink;
use crate::time::{SystemTime, TimeSource};
use crate::validation::Validator;

const COMPONENT_DEADLINE: Duration = Duration::from_secs(30);

async fn create_sink(
    config: &Config,
    liveness: &HealthRegistry,
    shutdown: &CancellationToken,
) -> anyhow::Result<Arc<dyn Sink + Send + Sync>> {
    if config.print_sink {
        // Print sink is only used for local debug, don't allow a container with it to run on prod
        liveness
            .register("sink".to_string(), COMPONENT_DEADLINE)
            .report_status(ComponentStatus::Unhealthy);

        Ok(Arc::new(PrintSink {}))
    } else {
        let sink_liveness = liveness.register("sink".to_string(), COMPONENT_DEADLINE);

        let sink = RedisSink::new(
            &config.redis.url,
            config.redis.queue_key.clone(),
            config.redis.response_timeout(),
            config.redis.connection_timeout(),
        )
        .await
        .context("failed to start Redis sink")?;
        sink_liveness.report_healthy();

        {
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sink.report_liveness(sink_liveness, shutdown).await });
        }
        Ok(Arc::new(sink))
    }
}

/// Builds every component from the configuration and serves until `shutdown` resolves.
///
/// On shutdown, the listener stops accepting connections and every in-flight sink call
/// is cancelled, so pending requests answer quickly instead of holding the process.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");
    let root = CancellationToken::new();

    config.validate()?;
    let limiter = AdmissionLimiter::new(config.admission_config())
        .context("invalid rate limit configuration")?;
    let sink = create_sink(&config, &liveness, &root).await?;

    let timesource: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});
    let guard = IdempotencyGuard::new(config.window_config());
    {
        // Ensure that the idempotency window is swept even without traffic
        let guard = guard.clone();
        let timesource = timesource.clone();
        let period = config.window_sweep_interval();
        let handle =
            liveness.register("idempotency_window".to_string(), period + COMPONENT_DEADLINE);
        let shutdown = root.clone();
        tokio::spawn(async move {
            guard
                .sweep_expired(timesource, period, handle, shutdown)
                .await
        });
    }

    let pipeline = Pipeline::new(
        Validator::new(config.validator_config()),
        guard,
        DispatchGate::new(limiter, sink, config.sink_timeout()),
        timesource,
    );

    let app = router::router(
        pipeline,
        liveness,
        root.clone(),
        RouterOptions {
            max_body_size: config.max_body_size,
            concurrency_limit: config.concurrency_limit,
            metrics: config.export_prometheus,
        },
    );

    info!("listening on {:?}", listener.local_addr()?);
    let graceful = {
        let root = root.clone();
        async move {
            shutdown.await;
            info!("shutting down, cancelling in-flight signals");
            root.cancel();
        }
    };
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(graceful)
        .await
        .context("server error")?;

    // stops the background loops if the server exited on its own
    root.cancel();
    Ok(())
}
