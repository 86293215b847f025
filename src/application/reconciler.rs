use super::ledger::TransactionLedger;
use super::lifecycle::InvoiceLifecycle;
use crate::domain::clock::Clock;
use crate::domain::invoice::{Invoice, InvoiceStatus};
use crate::domain::ports::{ProcessorOutcome, SharedProcessor, SharedTransactionStore};
use crate::domain::transaction::{Reference, Transaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a verification did to the owning invoice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvoiceEffect {
    Unchanged,
    Settled { paid_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub invoice: Invoice,
    pub transaction: Transaction,
    pub effect: InvoiceEffect,
}

impl Verification {
    pub fn status(&self) -> TransactionStatus {
        self.transaction.status
    }

    /// The processor has not decided yet; verifying again later is safe.
    pub fn retry_later(&self) -> bool {
        self.transaction.status == TransactionStatus::Pending
    }

    fn unchanged(invoice: Invoice, transaction: Transaction) -> Self {
        Self {
            invoice,
            transaction,
            effect: InvoiceEffect::Unchanged,
        }
    }
}

/// Maps processor verification results onto the ledger and the invoice.
///
/// The only component that resolves a Pending transaction. Safe to call any
/// number of times: every write is conditional on the transaction still being
/// Pending, and no lock is held across the processor call.
pub struct VerificationReconciler {
    lifecycle: Arc<InvoiceLifecycle>,
    ledger: Arc<TransactionLedger>,
    transactions: SharedTransactionStore,
    processor: SharedProcessor,
    clock: Arc<dyn Clock>,
}

impl VerificationReconciler {
    pub fn new(
        lifecycle: Arc<InvoiceLifecycle>,
        ledger: Arc<TransactionLedger>,
        transactions: SharedTransactionStore,
        processor: SharedProcessor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lifecycle,
            ledger,
            transactions,
            processor,
            clock,
        }
    }

    pub async fn verify(&self, tx: Transaction) -> Result<Verification> {
        let invoice = self.lifecycle.get(tx.invoice_id).await?;

        // A settled attempt is authoritative; make sure the invoice agrees.
        if tx.status == TransactionStatus::Success {
            return self.settle(invoice, tx).await;
        }

        let invoice = self.lifecycle.check_active(invoice).await?;
        if tx.status != TransactionStatus::Pending {
            debug!(transaction_id = %tx.id, status = %tx.status, "already resolved locally");
            return Ok(Verification::unchanged(invoice, tx));
        }

        let outcome = match self.processor.verify(&tx.reference).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    transaction_id = %tx.id,
                    reference = %tx.reference,
                    processor = self.processor.name(),
                    error = %e,
                    "verification call failed"
                );
                return Err(e.into());
            }
        };

        let next = match outcome {
            ProcessorOutcome::Success => TransactionStatus::Success,
            ProcessorOutcome::Failed | ProcessorOutcome::Reversed => TransactionStatus::Failed,
            ProcessorOutcome::Abandoned => TransactionStatus::Abandoned,
            ProcessorOutcome::Pending => {
                debug!(transaction_id = %tx.id, "processor still pending");
                return Ok(Verification::unchanged(invoice, tx));
            }
        };

        let resolved = tx.resolved(next, self.clock.now());
        match self
            .transactions
            .update_if_status(resolved.clone(), TransactionStatus::Pending)
            .await
        {
            Ok(()) => {
                info!(
                    invoice_id = %invoice.id,
                    transaction_id = %resolved.id,
                    reference = %resolved.reference,
                    status = %next,
                    ?outcome,
                    "transaction resolved"
                );
            }
            Err(PaymentError::ConflictError(_)) => {
                // Another verifier got there first; report what it decided.
                let current = self.ledger.get(tx.id).await?;
                debug!(transaction_id = %tx.id, status = %current.status, "lost resolution race");
                if current.status == TransactionStatus::Success {
                    return self.settle(invoice, current).await;
                }
                return Ok(Verification::unchanged(invoice, current));
            }
            Err(e) => return Err(e),
        }

        if next == TransactionStatus::Success {
            self.settle(invoice, resolved).await
        } else {
            Ok(Verification::unchanged(invoice, resolved))
        }
    }

    /// Webhook entry point: reconcile the transaction a processor event refers to.
    pub async fn verify_reference(&self, reference: &Reference) -> Result<Verification> {
        let tx = self.ledger.by_reference(reference).await?;
        self.verify(tx).await
    }

    async fn settle(&self, invoice: Invoice, tx: Transaction) -> Result<Verification> {
        if invoice.status == InvoiceStatus::Paid {
            return Ok(Verification::unchanged(invoice, tx));
        }
        let (invoice, transitioned) = self.lifecycle.mark_paid(invoice, tx.id).await?;
        let effect = match (transitioned, invoice.paid_at) {
            (true, Some(paid_at)) => InvoiceEffect::Settled { paid_at },
            _ => InvoiceEffect::Unchanged,
        };
        Ok(Verification {
            invoice,
            transaction: tx,
            effect,
        })
    }
}
