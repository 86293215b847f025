//! Runtime settings consumed by the application layer.
//!
//! The binary maps CLI flags and environment variables onto [`Settings`];
//! library users construct it directly.

use chrono::Duration as ChronoDuration;
use clap::ValueEnum;
use std::time::Duration;

/// How an `Abandoned` latest transaction is treated when a new charge is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AbandonedPolicy {
    /// No automatic path forward; the invoice needs manual resolution.
    #[default]
    Terminal,
    /// Behaves like `Failed`: the next charge starts a fresh attempt.
    Retryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProcessorKind {
    #[default]
    Sandbox,
    Paystack,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Lifetime of a freshly issued invoice when the caller supplies no expiry.
    pub invoice_ttl: ChronoDuration,
    /// Entropy bytes per transaction reference.
    pub reference_bytes: usize,
    pub abandoned_policy: AbandonedPolicy,
    /// Upper bound on a single processor call.
    pub processor_timeout: Duration,
    /// Extra attempts for retry-safe processor calls.
    pub processor_retries: u32,
    pub processor_backoff: Duration,
    /// Attempts at moving the invoice to Paid after its transaction settled.
    pub settle_write_retries: u32,
    /// How long an attempt claimed on an invoice may go without its ledger
    /// entry before another starter may take it over.
    pub attempt_claim_ttl: ChronoDuration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            invoice_ttl: ChronoDuration::hours(24),
            reference_bytes: 12,
            abandoned_policy: AbandonedPolicy::Terminal,
            processor_timeout: Duration::from_secs(15),
            processor_retries: 2,
            processor_backoff: Duration::from_millis(250),
            settle_write_retries: 5,
            attempt_claim_ttl: ChronoDuration::seconds(30),
        }
    }
}
