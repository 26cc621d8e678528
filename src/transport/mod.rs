//! HTTP transport client
//!
//! Posts JSON batches to the ingest endpoint, one path per channel, with a
//! bearer service key. Responses are classified as success, retryable or
//! permanent; retryable failures get a bounded number of attempts with a
//! delay that grows linearly with the attempt number. The outcome is always
//! a value, never an error: a batch that cannot be delivered is dropped and
//! the host is unaffected.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::{BufferEntry, Channel};
use crate::config::TelemetryConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint must be an http(s) url: {0}")]
    InvalidEndpoint(String),

    #[error("failed to build http client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}

/// How a response or transport failure is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Retryable,
    Permanent,
}

/// Classify an HTTP status code
///
/// 2xx succeeds, 429 and 5xx earn a retry, everything else is permanent.
pub fn classify_status(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        429 => ResponseClass::Retryable,
        500..=599 => ResponseClass::Retryable,
        _ => ResponseClass::Permanent,
    }
}

/// Terminal result of a delivery attempt sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Dropped(DropCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// Endpoint rejected the batch; retrying would not help
    Permanent,
    /// Every allowed attempt failed with a retryable error
    RetriesExhausted,
}

/// Blocking ingest client shared by all channels
pub struct TransportClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    service_key: String,
    max_attempts: u32,
    base_delay: Duration,
}

impl TransportClient {
    pub fn new(config: &TelemetryConfig) -> Result<Self, TransportError> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        if config.enabled
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(TransportError::InvalidEndpoint(config.endpoint.clone()));
        }
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config.transport.connect_timeout_secs))
            .timeout(Duration::from_secs(config.transport.request_timeout_secs))
            .user_agent(format!("kodama-telemetry/{}", crate::VERSION))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            service_key: config.service_key.clone(),
            max_attempts: config.transport.max_attempts.max(1),
            base_delay: Duration::from_millis(config.transport.base_delay_millis),
        })
    }

    /// Deliver one batch, retrying retryable failures up to `max_attempts`
    ///
    /// Blocks the calling thread, including during backoff sleeps. The delay
    /// before attempt `n + 1` is `base_delay * n`.
    pub fn send(&self, channel: Channel, batch: &[BufferEntry]) -> DeliveryOutcome {
        if batch.is_empty() {
            return DeliveryOutcome::Delivered;
        }
        let url = format!("{}/{}", self.endpoint, channel.path());

        for attempt in 1..=self.max_attempts {
            match self.dispatch(&url, batch) {
                Ok(status) => match classify_status(status) {
                    ResponseClass::Success => {
                        debug!(channel = %channel, entries = batch.len(), attempt, "batch delivered");
                        return DeliveryOutcome::Delivered;
                    }
                    ResponseClass::Retryable => {
                        debug!(channel = %channel, status, attempt, "retryable response");
                    }
                    ResponseClass::Permanent => {
                        warn!(channel = %channel, status, "batch rejected, dropping");
                        return DeliveryOutcome::Dropped(DropCause::Permanent);
                    }
                },
                Err(e) if e.is_timeout() || e.is_connect() => {
                    debug!(channel = %channel, error = %e, attempt, "transient transport error");
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "transport error, dropping batch");
                    return DeliveryOutcome::Dropped(DropCause::Permanent);
                }
            }
            if attempt < self.max_attempts {
                std::thread::sleep(self.base_delay * attempt);
            }
        }

        warn!(channel = %channel, attempts = self.max_attempts, "attempts exhausted, dropping batch");
        DeliveryOutcome::Dropped(DropCause::RetriesExhausted)
    }

    fn dispatch(&self, url: &str, batch: &[BufferEntry]) -> Result<u16, reqwest::Error> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.service_key)
            .json(batch)
            .send()?;
        Ok(response.status().as_u16())
    }
}
