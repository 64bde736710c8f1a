use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

use crate::event::{Entity, RawEntity, RawSignalPayload, SignalData, SignalPayload};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid signal")]
    InvalidSignal,
    #[error("timestamp out of range")]
    TimestampOutOfRange,
}

impl ValidationError {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ValidationError::MalformedPayload(_) => "malformed_payload",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::InvalidSignal => "invalid_signal",
            ValidationError::TimestampOutOfRange => "timestamp_out_of_range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// How far in the past `occurred_at` may be, relative to the server clock
    pub max_past_skew: Duration,
    /// How far in the future `occurred_at` may be, to absorb client clock drift
    pub max_future_skew: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_past_skew: Duration::from_secs(24 * 60 * 60),
            max_future_skew: Duration::from_secs(5 * 60),
        }
    }
}

/// Turns untrusted input into a [`SignalPayload`].
///
/// Rules are checked in a fixed order and the first failure wins, so a given input
/// always produces the same error:
///   1. the body decodes as a signal object
///   2. `event_id` is present and non-empty
///   3. `actor.id`, `actor.type`, `subject.id`, `subject.type` are present and non-empty
///   4. `signal.name` is non-empty and `signal.value` is finite
///   5. `occurred_at` is non-negative and within the configured skew of `now`
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn validate(
        &self,
        bytes: &[u8],
        now: OffsetDateTime,
    ) -> Result<SignalPayload, ValidationError> {
        let raw = RawSignalPayload::from_bytes(bytes)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        self.validate_fields(raw, now)
    }

    pub fn validate_fields(
        &self,
        raw: RawSignalPayload,
        now: OffsetDateTime,
    ) -> Result<SignalPayload, ValidationError> {
        let event_id = required(raw.event_id, "event_id")?;
        let actor = entity(raw.actor, "actor.id", "actor.type")?;
        let subject = entity(raw.subject, "subject.id", "subject.type")?;

        let signal = raw.signal.unwrap_or_default();
        let name = signal
            .name
            .filter(|name| !name.is_empty())
            .ok_or(ValidationError::InvalidSignal)?;
        let value = signal
            .value
            .filter(|value| value.is_finite())
            .ok_or(ValidationError::InvalidSignal)?;

        let occurred_at = raw
            .occurred_at
            .ok_or(ValidationError::MissingField("occurred_at"))?;
        self.check_timestamp(occurred_at, now)?;

        Ok(SignalPayload::new(
            event_id,
            actor,
            subject,
            SignalData::new(name, value),
            occurred_at,
        ))
    }

    fn check_timestamp(
        &self,
        occurred_at: i64,
        now: OffsetDateTime,
    ) -> Result<(), ValidationError> {
        let now = now.unix_timestamp();
        let earliest = now.saturating_sub(as_seconds(self.config.max_past_skew));
        let latest = now.saturating_add(as_seconds(self.config.max_future_skew));

        if occurred_at < 0 || occurred_at < earliest || occurred_at > latest {
            return Err(ValidationError::TimestampOutOfRange);
        }
        Ok(())
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField(field))
}

fn entity(
    raw: Option<RawEntity>,
    id_field: &'static str,
    type_field: &'static str,
) -> Result<Entity, ValidationError> {
    let raw = raw.unwrap_or_default();
    let id = required(raw.id, id_field)?;
    let kind = required(raw.kind, type_field)?;
    Ok(Entity::new(id, kind))
}

fn as_seconds(skew: Duration) -> i64 {
    i64::try_from(skew.as_secs()).unwrap_or(i64::MAX)
}
