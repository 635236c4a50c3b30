//! Optional JSONL recording of inbound webhooks and outbound API traffic.

use anyhow::{Context, Result};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::time::Duration;

pub mod logger;
pub mod middleware;

pub use bunsen_core::recording::*;
pub use logger::RecordingLogger;
pub use middleware::RecordingMiddleware;

/// HTTP client for one outbound service, with traffic recorded when a logger is given.
pub fn create_http_client(
    recording_logger: Option<RecordingLogger>,
    service_type: ServiceType,
) -> Result<ClientWithMiddleware> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("bunsen/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to create HTTP client")?;

    let mut builder = ClientBuilder::new(client);
    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger, service_type));
    }

    Ok(builder.build())
}
