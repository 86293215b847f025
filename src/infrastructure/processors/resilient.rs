//! Timeout and retry policy around any [`PaymentProcessor`].
//!
//! # Retry policy
//!
//! - Every call is bounded by `timeout`; an expired call is reported as
//!   [`ProcessorError::Timeout`] and its outcome is unknown.
//! - `initiate`, `verify` and `refund` are retried on transient errors
//!   (transport failures and timeouts) up to `max_retries` times, with
//!   exponential backoff and down-jitter. Each is keyed by the transaction
//!   reference, so the gateway deduplicates repeats.
//! - `charge` is never retried.

use crate::config::Settings;
use crate::domain::invoice::Amount;
use crate::domain::ports::{PaymentProcessor, ProcessorOutcome};
use crate::domain::transaction::Reference;
use crate::error::ProcessorError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Upper bound on a single call.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Down-jitter factor (0.25 = up to 25% shorter).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            jitter_factor: 0.25,
        }
    }
}

impl From<&Settings> for RetryConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            timeout: settings.processor_timeout,
            max_retries: settings.processor_retries,
            initial_delay: settings.processor_backoff,
            ..Self::default()
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `step` (0-based).
    pub fn delay(&self, step: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(step.min(16) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 - rand::random::<f64>() * self.jitter_factor;
        Duration::from_secs_f64(capped * jitter)
    }
}

pub struct ResilientProcessor<P> {
    inner: P,
    config: RetryConfig,
}

impl<P: PaymentProcessor> ResilientProcessor<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ProcessorError>
    where
        F: Future<Output = Result<T, ProcessorError>>,
    {
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProcessorError::Timeout(self.config.timeout)),
        }
    }

    async fn retried<T, F, Fut>(&self, op: &'static str, reference: &Reference, mut call: F) -> Result<T, ProcessorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProcessorError>>,
    {
        let mut step = 0;
        loop {
            match self.bounded(call()).await {
                Err(e) if e.is_transient() && step < self.config.max_retries => {
                    let delay = self.config.delay(step);
                    warn!(
                        processor = self.inner.name(),
                        op,
                        reference = %reference,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "transient processor failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    step += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<P: PaymentProcessor> PaymentProcessor for ResilientProcessor<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn initiate(
        &self,
        email: &str,
        amount: Amount,
        reference: &Reference,
    ) -> Result<String, ProcessorError> {
        self.retried("initiate", reference, || self.inner.initiate(email, amount, reference))
            .await
    }

    async fn charge(
        &self,
        email: &str,
        amount: Amount,
        instrument_token: &str,
        reference: &Reference,
    ) -> Result<(), ProcessorError> {
        self.bounded(self.inner.charge(email, amount, instrument_token, reference))
            .await
    }

    async fn verify(&self, reference: &Reference) -> Result<ProcessorOutcome, ProcessorError> {
        self.retried("verify", reference, || self.inner.verify(reference))
            .await
    }

    async fn refund(&self, reference: &Reference) -> Result<(), ProcessorError> {
        self.retried("refund", reference, || self.inner.refund(reference))
            .await
    }

    fn webhook_signature_header(&self) -> &'static str {
        self.inner.webhook_signature_header()
    }

    fn webhook_reference(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<Reference, ProcessorError> {
        self.inner.webhook_reference(signature, body)
    }
}
