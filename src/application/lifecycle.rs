use crate::config::Settings;
use crate::domain::clock::Clock;
use crate::domain::customer::Customer;
use crate::domain::invoice::{Amount, Invoice, InvoiceStatus};
use crate::domain::ports::{InvoiceFilter, SharedCustomerDirectory, SharedInvoiceStore};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters for [`InvoiceLifecycle::ensure_issued`].
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub customer_id: Uuid,
    pub amount: Amount,
    pub description: String,
    /// Defaults to now + the configured invoice lifetime.
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

/// Owns the invoice state machine. Every invoice write in the crate goes
/// through here and is a conditional update against the status just read.
pub struct InvoiceLifecycle {
    invoices: SharedInvoiceStore,
    customers: SharedCustomerDirectory,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    claim_ttl: Duration,
    write_retries: u32,
}

impl InvoiceLifecycle {
    pub fn new(
        invoices: SharedInvoiceStore,
        customers: SharedCustomerDirectory,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        Self {
            invoices,
            customers,
            clock,
            ttl: settings.invoice_ttl,
            claim_ttl: settings.attempt_claim_ttl,
            write_retries: settings.settle_write_retries,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Loads an invoice as stored, without evaluating expiry.
    pub async fn get(&self, invoice_id: Uuid) -> Result<Invoice> {
        self.invoices
            .get(invoice_id)
            .await?
            .ok_or_else(|| PaymentError::NotFoundError(format!("invoice {invoice_id}")))
    }

    pub async fn find(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        self.invoices.find(filter).await
    }

    pub async fn customer(&self, customer_id: Uuid) -> Result<Customer> {
        self.customers.customer(customer_id).await?.ok_or_else(|| {
            PaymentError::ValidationError(format!("unknown customer {customer_id}"))
        })
    }

    /// Issues a new invoice, or returns the one already issued for the same
    /// customer and idempotency key.
    pub async fn ensure_issued(&self, request: IssueRequest) -> Result<Invoice> {
        self.customer(request.customer_id).await?;

        if let Some(existing) = self.find_by_key(&request).await? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let expires_at = request.expires_at.unwrap_or(now + self.ttl);
        if expires_at <= now {
            return Err(PaymentError::ValidationError(
                "invoice expiry must be in the future".to_string(),
            ));
        }

        let invoice = Invoice::issued(
            request.customer_id,
            request.amount,
            request.description.clone(),
            now,
            expires_at,
        )
        .with_idempotency_key(request.idempotency_key.clone());

        match self.invoices.insert(invoice.clone()).await {
            Ok(()) => {
                info!(
                    invoice_id = %invoice.id,
                    customer_id = %invoice.customer_id,
                    amount = %invoice.amount,
                    expires_at = %expires_at,
                    "invoice issued"
                );
                Ok(invoice)
            }
            // A concurrent request with the same key won the insert.
            Err(PaymentError::ConflictError(reason)) => match self.find_by_key(&request).await? {
                Some(existing) => Ok(existing),
                None => Err(PaymentError::ConflictError(reason)),
            },
            Err(e) => Err(e),
        }
    }

    async fn find_by_key(&self, request: &IssueRequest) -> Result<Option<Invoice>> {
        let Some(key) = &request.idempotency_key else {
            return Ok(None);
        };
        let filter = InvoiceFilter::IdempotencyKey {
            customer_id: request.customer_id,
            key: key.clone(),
        };
        let Some(existing) = self.invoices.find(&filter).await?.into_iter().next() else {
            return Ok(None);
        };
        if existing.amount != request.amount {
            return Err(PaymentError::ValidationError(format!(
                "idempotency key already used for invoice {} with amount {}",
                existing.id, existing.amount
            )));
        }
        debug!(invoice_id = %existing.id, "idempotency key matched existing invoice");
        Ok(Some(existing))
    }

    pub async fn create_draft(
        &self,
        customer_id: Uuid,
        amount: Amount,
        description: String,
    ) -> Result<Invoice> {
        self.customer(customer_id).await?;
        let invoice = Invoice::draft(customer_id, amount, description, self.clock.now());
        self.invoices.insert(invoice.clone()).await?;
        info!(invoice_id = %invoice.id, customer_id = %customer_id, "draft invoice created");
        Ok(invoice)
    }

    /// Draft -> Issued.
    pub async fn issue(&self, invoice_id: Uuid) -> Result<Invoice> {
        let mut invoice = self.get(invoice_id).await?;
        invoice.issue(self.clock.now() + self.ttl)?;
        let stored = self
            .invoices
            .update_if_status(invoice, InvoiceStatus::Draft)
            .await?;
        info!(invoice_id = %invoice_id, "invoice issued from draft");
        Ok(stored)
    }

    pub async fn cancel(&self, invoice_id: Uuid) -> Result<Invoice> {
        let invoice = self.refresh(self.get(invoice_id).await?).await?;
        let expected = invoice.status;
        let mut cancelled = invoice;
        cancelled.cancel()?;
        let stored = self.invoices.update_if_status(cancelled, expected).await?;
        info!(invoice_id = %invoice_id, "invoice cancelled");
        Ok(stored)
    }

    /// Applies a due Issued -> Expired transition and returns the invoice as
    /// it now stands, whatever its status.
    pub async fn refresh(&self, invoice: Invoice) -> Result<Invoice> {
        let mut current = invoice;
        for _ in 0..=self.write_retries {
            if !current.is_due_to_expire(self.clock.now()) {
                return Ok(current);
            }
            let mut expired = current.clone();
            expired.expire()?;
            match self
                .invoices
                .update_if_status(expired, InvoiceStatus::Issued)
                .await
            {
                Ok(stored) => {
                    info!(invoice_id = %stored.id, "invoice expired");
                    return Ok(stored);
                }
                Err(PaymentError::ConflictError(_)) => {
                    current = self.get(current.id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::ConflictError(format!(
            "invoice {} kept changing while evaluating expiry",
            current.id
        )))
    }

    /// Returns the invoice only if it can still be charged or verified.
    pub async fn check_active(&self, invoice: Invoice) -> Result<Invoice> {
        let invoice = self.refresh(invoice).await?;
        match invoice.status {
            InvoiceStatus::Issued => Ok(invoice),
            InvoiceStatus::Draft => Err(PaymentError::UnsupportedStateError(format!(
                "invoice {} is a draft and must be issued first",
                invoice.id
            ))),
            status => Err(PaymentError::TerminalStateError {
                invoice_id: invoice.id,
                status,
            }),
        }
    }

    /// Claims settlement attempt number `sequence` on a still-live invoice.
    ///
    /// The counter must trail the ledger by one: a counter already at
    /// `sequence` means another starter holds the claim. A claim that never
    /// reached the ledger lapses after `attempt_claim_ttl`.
    pub async fn claim_attempt(&self, invoice: &Invoice, sequence: u32) -> Result<Invoice> {
        let mut current = invoice.clone();
        for _ in 0..=self.write_retries {
            let live = self.check_active(current).await?;
            let now = self.clock.now();
            let lapsed = live.attempts == sequence
                && live
                    .last_attempt_at
                    .is_some_and(|at| now - at > self.claim_ttl);
            if live.attempts >= sequence && !lapsed {
                return Err(PaymentError::ConflictError(format!(
                    "attempt {sequence} for invoice {} is already being started",
                    live.id
                )));
            }
            if lapsed {
                warn!(invoice_id = %live.id, sequence, "reclaiming an attempt that never reached the ledger");
            }

            let mut next = live.clone();
            next.record_attempt(sequence, now)?;
            match self
                .invoices
                .update_if_status(next, InvoiceStatus::Issued)
                .await
            {
                Ok(stored) => return Ok(stored),
                Err(PaymentError::ConflictError(_)) => {
                    current = self.get(live.id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::ConflictError(format!(
            "invoice {} kept changing while claiming attempt {sequence}",
            invoice.id
        )))
    }

    /// Gives back a claim whose transaction never made it into the ledger.
    pub async fn release_attempt(&self, claimed: &Invoice, sequence: u32) {
        let mut released = claimed.clone();
        released.attempts = sequence.saturating_sub(1);
        if let Err(e) = self
            .invoices
            .update_if_status(released, InvoiceStatus::Issued)
            .await
        {
            warn!(
                invoice_id = %claimed.id,
                sequence,
                error = %e,
                "attempt claim not released; it lapses on its own"
            );
        }
    }

    /// Moves the invoice to Paid on behalf of a settled transaction.
    ///
    /// Retries through conflicts and store failures; returns the invoice and
    /// whether this call performed the transition.
    pub async fn mark_paid(&self, invoice: Invoice, transaction_id: Uuid) -> Result<(Invoice, bool)> {
        let invoice_id = invoice.id;
        let mut current = Some(invoice);
        for attempt in 0..=self.write_retries {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10 * u64::from(attempt))).await;
            }
            let invoice = match current.take() {
                Some(invoice) => invoice,
                None => match self.get(invoice_id).await {
                    Ok(invoice) => invoice,
                    Err(e) => {
                        warn!(invoice_id = %invoice_id, error = %e, "re-reading invoice for settlement failed");
                        continue;
                    }
                },
            };
            match invoice.status {
                InvoiceStatus::Paid => return Ok((invoice, false)),
                // Settlement outranks an expiry that has not been written yet.
                InvoiceStatus::Issued => {}
                status => {
                    warn!(
                        invoice_id = %invoice_id,
                        transaction_id = %transaction_id,
                        %status,
                        "settled transaction belongs to an invoice that is no longer payable"
                    );
                    break;
                }
            }
            let mut paid = invoice;
            paid.mark_paid(self.clock.now())?;
            match self
                .invoices
                .update_if_status(paid, InvoiceStatus::Issued)
                .await
            {
                Ok(stored) => {
                    info!(invoice_id = %invoice_id, transaction_id = %transaction_id, "invoice paid");
                    return Ok((stored, true));
                }
                Err(e @ (PaymentError::ConflictError(_) | PaymentError::PersistenceError(_))) => {
                    warn!(invoice_id = %invoice_id, error = %e, attempt, "retrying paid write");
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::ReconciliationRequired {
            invoice_id,
            transaction_id,
        })
    }
}
