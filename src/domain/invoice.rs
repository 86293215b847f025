use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A positive amount in the smallest currency unit (kobo, cents, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Amount(u64);

impl Amount {
    pub fn new(value: u64) -> Result<Self, PaymentError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for Amount {
    type Error = PaymentError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for u64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Expired,
    Cancelled,
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Expired | Self::Cancelled)
    }

    /// Forward-only transition table.
    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Issued)
                | (Draft, Cancelled)
                | (Issued, Issued)
                | (Issued, Paid)
                | (Issued, Expired)
                | (Issued, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Issued => "issued",
            Self::Paid => "paid",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One obligation to collect a fixed amount from one customer.
///
/// Records are mutated only through the transition methods below, which keep
/// `paid_at` set exactly when the status is `Paid` and never touch `amount`
/// or `expires_at` once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub amount: Amount,
    pub description: String,
    pub status: InvoiceStatus,
    /// Number of settlement attempts started against this invoice.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Unset while the invoice is a draft.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Client-supplied key that makes repeated `initiate` requests resolve to one invoice.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Bumped by the store on every successful conditional update.
    #[serde(default)]
    pub revision: u64,
}

impl Invoice {
    pub fn draft(customer_id: Uuid, amount: Amount, description: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            amount,
            description,
            status: InvoiceStatus::Draft,
            attempts: 0,
            last_attempt_at: None,
            paid_at: None,
            expires_at: None,
            created_at: now,
            idempotency_key: None,
            revision: 0,
        }
    }

    pub fn issued(
        customer_id: Uuid,
        amount: Amount,
        description: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let mut invoice = Self::draft(customer_id, amount, description, now);
        invoice.status = InvoiceStatus::Issued;
        invoice.expires_at = Some(expires_at);
        invoice
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Whether an issued invoice has run past its expiry.
    pub fn is_due_to_expire(&self, now: DateTime<Utc>) -> bool {
        self.status == InvoiceStatus::Issued && self.expires_at.is_some_and(|at| now > at)
    }

    fn transition(&mut self, next: InvoiceStatus) -> Result<(), PaymentError> {
        if self.status.can_transition_to(next) {
            self.status = next;
            Ok(())
        } else if self.status.is_terminal() {
            Err(PaymentError::TerminalStateError {
                invoice_id: self.id,
                status: self.status,
            })
        } else {
            Err(PaymentError::UnsupportedStateError(format!(
                "invoice {} cannot move from {} to {}",
                self.id, self.status, next
            )))
        }
    }

    /// Draft -> Issued. Fixes the expiry for good.
    pub fn issue(&mut self, expires_at: DateTime<Utc>) -> Result<(), PaymentError> {
        if self.status != InvoiceStatus::Draft {
            return Err(PaymentError::UnsupportedStateError(format!(
                "invoice {} is {}, only drafts can be issued",
                self.id, self.status
            )));
        }
        self.transition(InvoiceStatus::Issued)?;
        self.expires_at = Some(expires_at);
        Ok(())
    }

    pub fn expire(&mut self) -> Result<(), PaymentError> {
        self.transition(InvoiceStatus::Expired)
    }

    pub fn cancel(&mut self) -> Result<(), PaymentError> {
        self.transition(InvoiceStatus::Cancelled)
    }

    pub fn mark_paid(&mut self, now: DateTime<Utc>) -> Result<(), PaymentError> {
        self.transition(InvoiceStatus::Paid)?;
        self.paid_at = Some(now);
        Ok(())
    }

    /// Issued -> Issued bookkeeping for settlement attempt number `sequence`.
    /// An invoice past its expiry takes no further attempts.
    pub fn record_attempt(&mut self, sequence: u32, now: DateTime<Utc>) -> Result<(), PaymentError> {
        if self.is_due_to_expire(now) {
            return Err(PaymentError::TerminalStateError {
                invoice_id: self.id,
                status: InvoiceStatus::Expired,
            });
        }
        self.transition(InvoiceStatus::Issued)?;
        self.attempts = sequence;
        self.last_attempt_at = Some(now);
        Ok(())
    }
}
