//! NATS integration.
//!
//! Task requests go out on a JetStream stream so executors can pick them up
//! after a restart; cancellations and transition events use core NATS.

pub mod publisher;

pub use publisher::{NatsError, NatsEventSink, NatsTaskTransport};

/// Connect to NATS if a URL is configured. Failures are logged and the
/// engine falls back to in-process dispatch.
pub async fn connect(url: Option<&str>) -> Option<async_nats::Client> {
    let url = url?;
    match async_nats::connect(url).await {
        Ok(client) => {
            tracing::info!(url = %url, "Connected to NATS");
            Some(client)
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Failed to connect to NATS, using in-process dispatch");
            None
        }
    }
}
