//! Admission control in front of the sink.
//!
//! A single token bucket protects the downstream queue: every signal that passed
//! validation and deduplication needs one token to be dispatched. When the bucket is
//! empty, the signal is refused with a 429 and the client is expected to back off.
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;

// Slowest refill we accept, one token a day. Use a zero rate for a bucket that never refills.
const MAX_REFILL_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum number of tokens, i.e. the largest burst admitted at once
    pub capacity: NonZeroU32,
    /// Tokens added per second, zero means the bucket never refills
    pub refill_rate: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroU32::new(1000).unwrap_or(NonZeroU32::MIN),
            refill_rate: 500.0,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum AdmissionConfigError {
    #[error("refill rate must be a finite, non-negative number of tokens per second, got {0}")]
    InvalidRefillRate(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// No token left. `retry_after` is the wait until the next token, unknown if the
    /// bucket does not refill.
    Throttled {
        retry_after: Option<Duration>,
    },
}

enum Bucket {
    // See: https://docs.rs/governor/latest/governor/_guide/index.html#usage-in-multiple-threads
    Refilling {
        limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
        clock: DefaultClock,
    },
    // governor cannot express a zero refill rate, count down a fixed budget instead
    Budget {
        remaining: AtomicU32,
    },
}

#[derive(Clone)]
pub struct AdmissionLimiter {
    bucket: Arc<Bucket>,
}

impl AdmissionLimiter {
    pub fn new(config: AdmissionConfig) -> Result<Self, AdmissionConfigError> {
        let rate = config.refill_rate;
        if !rate.is_finite() || rate < 0.0 {
            return Err(AdmissionConfigError::InvalidRefillRate(rate));
        }

        let bucket = if rate == 0.0 {
            Bucket::Budget {
                remaining: AtomicU32::new(config.capacity.get()),
            }
        } else {
            let period = Duration::try_from_secs_f64(1.0 / rate)
                .ok()
                .filter(|period| *period <= MAX_REFILL_PERIOD)
                .ok_or(AdmissionConfigError::InvalidRefillRate(rate))?;
            let quota = Quota::with_period(period)
                .ok_or(AdmissionConfigError::InvalidRefillRate(rate))?
                .allow_burst(config.capacity);
            let clock = DefaultClock::default();
            Bucket::Refilling {
                limiter: RateLimiter::direct_with_clock(quota, &clock),
                clock,
            }
        };

        Ok(Self {
            bucket: Arc::new(bucket),
        })
    }

    /// Takes one token if available. Safe to call concurrently, two callers never
    /// get the same token.
    pub fn try_acquire(&self) -> Admission {
        match self.bucket.as_ref() {
            Bucket::Refilling { limiter, clock } => match limiter.check() {
                Ok(()) => Admission::Granted,
                Err(not_until) => Admission::Throttled {
                    retry_after: Some(not_until.wait_time_from(clock.now())),
                },
            },
            Bucket::Budget { remaining } => {
                match remaining.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    n.checked_sub(1)
                }) {
                    Ok(_) => Admission::Granted,
                    Err(_) => Admission::Throttled { retry_after: None },
                }
            }
        }
    }
}
