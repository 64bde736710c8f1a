use std::net::SocketAddr;
use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

use crate::idempotency::WindowConfig;
use crate::limiters::AdmissionConfig;
use crate::validation::ValidatorConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:8080")]
    pub address: SocketAddr,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(default = "86400")]
    pub max_past_skew_secs: u64,

    #[envconfig(default = "300")]
    pub max_future_skew_secs: u64,

    #[envconfig(default = "600")]
    pub retention_secs: u64,

    #[envconfig(default = "100000")]
    pub max_entries: NonZeroUsize,

    #[envconfig(default = "30")]
    pub window_sweep_interval_secs: u64,

    #[envconfig(default = "1000")]
    pub rate_limit_capacity: NonZeroU32,

    #[envconfig(default = "500.0")]
    pub rate_limit_refill_rate: f64,

    #[envconfig(default = "2000")]
    pub sink_timeout_ms: u64,

    #[envconfig(default = "1000000")]
    pub max_body_size: usize,

    pub concurrency_limit: Option<usize>,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "signal-capture")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

#[derive(Envconfig, Clone)]
pub struct RedisConfig {
    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub url: String,

    #[envconfig(from = "REDIS_QUEUE_KEY", default = "signals_ingestion")]
    pub queue_key: String,

    // 0 disables the timeout
    #[envconfig(from = "REDIS_RESPONSE_TIMEOUT_MS", default = "100")]
    pub response_timeout_ms: u64,

    #[envconfig(from = "REDIS_CONNECTION_TIMEOUT_MS", default = "5000")]
    pub connection_timeout_ms: u64,
}

impl RedisConfig {
    pub fn response_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.response_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connection_timeout_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_past_skew: Duration::from_secs(self.max_past_skew_secs),
            max_future_skew: Duration::from_secs(self.max_future_skew_secs),
        }
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            retention: Duration::from_secs(self.retention_secs),
            max_entries: self.max_entries,
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            capacity: self.rate_limit_capacity,
            refill_rate: self.rate_limit_refill_rate,
        }
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn window_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.window_sweep_interval_secs)
    }

    /// Refuses values that parse but would silently break a component at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.window_sweep_interval_secs > 0,
            "WINDOW_SWEEP_INTERVAL_SECS must be positive"
        );
        anyhow::ensure!(self.sink_timeout_ms > 0, "SINK_TIMEOUT_MS must be positive");
        Ok(())
    }
}
