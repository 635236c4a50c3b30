//! The dispatch client: write-ahead records, bounded retries, overall deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bunsen_core::{DispatchContext, DispatchRecord};
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::{RepositoryError, ThreadStore};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    /// Network errors, timeouts, 408/429/5xx. Worth retrying.
    #[error("transient trigger failure: {0}")]
    Transient(String),
    #[error("permanent trigger failure: {0}")]
    Permanent(String),
}

impl TriggerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TriggerError::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if should_retry_status(status) {
            TriggerError::Transient(message)
        } else {
            TriggerError::Permanent(message)
        }
    }
}

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// Starts the downstream job. Implementations need not be idempotent.
#[async_trait]
pub trait JobTrigger: Send + Sync {
    async fn trigger(
        &self,
        context: &DispatchContext,
        correlation_id: Option<&str>,
    ) -> Result<(), TriggerError>;
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn exponential(initial: Duration) -> Self {
        Self {
            initial,
            multiplier: 2,
            max: Duration::from_secs(30),
        }
    }

    /// No waiting at all; for tests.
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1,
            max: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::exponential(Duration::from_millis(500)),
        }
    }
}

#[derive(Clone)]
pub struct DispatchClient {
    trigger: Arc<dyn JobTrigger>,
    store: ThreadStore,
    settings: DispatchSettings,
}

impl DispatchClient {
    pub fn new(trigger: Arc<dyn JobTrigger>, store: ThreadStore, settings: DispatchSettings) -> Self {
        Self {
            trigger,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run one dispatch to a terminal record.
    ///
    /// The record is stored as `pending` before the trigger is called, so a
    /// crash mid-dispatch leaves evidence for startup reconciliation. The
    /// returned record is always `succeeded` or `failed`; `Err` means the
    /// write-ahead insert itself failed and nothing was triggered.
    pub async fn dispatch(
        &self,
        context: &DispatchContext,
        correlation_id: Option<&str>,
    ) -> Result<DispatchRecord, RepositoryError> {
        let mut record = DispatchRecord::pending(
            Uuid::new_v4().to_string(),
            context.thread_id.clone(),
            context.delivery_id.clone(),
            Utc::now(),
        );
        self.store
            .repository()
            .insert_dispatch_record(&record)
            .await?;

        info!(
            "Dispatching job for {} (delivery {}, record {})",
            context.thread_id, context.delivery_id, record.id
        );

        let outcome = tokio::time::timeout(
            self.settings.timeout,
            self.run_attempts(&mut record, context, correlation_id),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                record.succeed(Utc::now());
                info!(
                    "Dispatch for {} succeeded after {} attempt(s)",
                    context.thread_id, record.attempts
                );
            }
            Ok(Err(e)) => {
                let message = if e.is_transient() {
                    format!("gave up after {} attempts: {}", record.attempts, e)
                } else {
                    e.to_string()
                };
                error!("Dispatch for {} failed: {}", context.thread_id, message);
                record.fail(message, Utc::now());
            }
            Err(_) => {
                let message = format!(
                    "timed out after {}s ({} attempt(s))",
                    self.settings.timeout.as_secs(),
                    record.attempts
                );
                error!("Dispatch for {} {}", context.thread_id, message);
                record.fail(message, Utc::now());
            }
        }

        if let Err(e) = self.store.repository().update_dispatch_record(&record).await {
            // The record stays pending in storage; reconciliation will close it.
            error!(
                "Failed to persist final state of dispatch record {}: {}",
                record.id, e
            );
        }

        Ok(record)
    }

    async fn run_attempts(
        &self,
        record: &mut DispatchRecord,
        context: &DispatchContext,
        correlation_id: Option<&str>,
    ) -> Result<(), TriggerError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.trigger.trigger(context, correlation_id).await;

            record.record_attempt(result.as_ref().err().map(ToString::to_string), Utc::now());
            if let Err(e) = self.store.repository().update_dispatch_record(record).await {
                warn!(
                    "Failed to persist attempt {} of dispatch record {}: {}",
                    attempt, record.id, e
                );
            }

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.settings.backoff.delay_for(attempt - 1);
                    warn!(
                        "Dispatch attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, max_attempts, context.thread_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
