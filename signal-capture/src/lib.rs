pub mod api;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod health;
pub mod idempotency;
pub mod limiters;
pub mod pipeline;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
pub mod validation;
