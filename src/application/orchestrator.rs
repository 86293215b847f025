use super::ledger::{NextStep, TransactionLedger};
use super::lifecycle::{InvoiceLifecycle, IssueRequest};
use super::reconciler::{Verification, VerificationReconciler};
use crate::config::Settings;
use crate::domain::clock::Clock;
use crate::domain::customer::Customer;
use crate::domain::invoice::{Amount, Invoice, InvoiceStatus};
use crate::domain::ports::{
    InvoiceFilter, ReferenceGenerator, SharedCustomerDirectory, SharedInvoiceStore, SharedProcessor,
    SharedTransactionStore,
};
use crate::domain::transaction::{Transaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// A charge request, decided by the caller up front.
#[derive(Debug, Clone)]
pub enum ChargeCommand {
    /// Issue (or re-find, by idempotency key) an invoice and charge it.
    Initiate {
        customer_id: Uuid,
        amount: Amount,
        description: String,
        idempotency_key: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Continue settling an existing invoice.
    Resume { customer_id: Uuid, invoice_id: Uuid },
}

impl ChargeCommand {
    pub fn customer_id(&self) -> Uuid {
        match self {
            Self::Initiate { customer_id, .. } | Self::Resume { customer_id, .. } => *customer_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChargeOutcome {
    /// The customer has no stored instrument and must complete a hosted checkout.
    Redirect {
        url: String,
        invoice: Invoice,
        transaction: Transaction,
    },
    /// A stored instrument was charged; the result arrives through verification.
    Submitted {
        invoice: Invoice,
        transaction: Transaction,
    },
    /// The current attempt is still pending at the processor.
    AwaitingVerification {
        invoice: Invoice,
        transaction: Transaction,
    },
    AlreadySettled {
        invoice: Invoice,
        transaction: Option<Transaction>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceSummary {
    pub invoice: Invoice,
    pub transactions: Vec<Transaction>,
}

/// Everything the orchestrator is wired from.
pub struct Collaborators {
    pub invoices: SharedInvoiceStore,
    pub transactions: SharedTransactionStore,
    pub customers: SharedCustomerDirectory,
    pub processor: SharedProcessor,
    pub references: Arc<dyn ReferenceGenerator>,
    pub clock: Arc<dyn Clock>,
}

pub struct ChargeOrchestrator {
    lifecycle: Arc<InvoiceLifecycle>,
    ledger: Arc<TransactionLedger>,
    reconciler: VerificationReconciler,
    customers: SharedCustomerDirectory,
    processor: SharedProcessor,
}

impl ChargeOrchestrator {
    pub fn new(collaborators: Collaborators, settings: &Settings) -> Self {
        let Collaborators {
            invoices,
            transactions,
            customers,
            processor,
            references,
            clock,
        } = collaborators;

        let lifecycle = Arc::new(InvoiceLifecycle::new(
            invoices,
            customers.clone(),
            clock.clone(),
            settings,
        ));
        let ledger = Arc::new(TransactionLedger::new(
            transactions.clone(),
            lifecycle.clone(),
            references,
            clock.clone(),
            settings,
        ));
        let reconciler = VerificationReconciler::new(
            lifecycle.clone(),
            ledger.clone(),
            transactions,
            processor.clone(),
            clock,
        );

        Self {
            lifecycle,
            ledger,
            reconciler,
            customers,
            processor,
        }
    }

    pub fn lifecycle(&self) -> &InvoiceLifecycle {
        &self.lifecycle
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    #[instrument(skip_all, fields(customer_id = %command.customer_id()))]
    pub async fn charge(&self, command: ChargeCommand) -> Result<ChargeOutcome> {
        let (customer, invoice) = match command {
            ChargeCommand::Initiate {
                customer_id,
                amount,
                description,
                idempotency_key,
                expires_at,
            } => {
                let invoice = self
                    .lifecycle
                    .ensure_issued(IssueRequest {
                        customer_id,
                        amount,
                        description,
                        expires_at,
                        idempotency_key,
                    })
                    .await?;
                (self.lifecycle.customer(customer_id).await?, invoice)
            }
            ChargeCommand::Resume {
                customer_id,
                invoice_id,
            } => {
                let customer = self.lifecycle.customer(customer_id).await?;
                let invoice = self.lifecycle.get(invoice_id).await?;
                if invoice.customer_id != customer_id {
                    return Err(PaymentError::ValidationError(format!(
                        "invoice {invoice_id} does not belong to customer {customer_id}"
                    )));
                }
                (customer, invoice)
            }
        };

        match self.advance(&customer, invoice).await {
            Err(PaymentError::TerminalStateError {
                invoice_id,
                status: InvoiceStatus::Paid,
            }) => {
                let invoice = self.lifecycle.get(invoice_id).await?;
                let transaction = self.ledger.latest(invoice_id).await?;
                Ok(ChargeOutcome::AlreadySettled {
                    invoice,
                    transaction,
                })
            }
            other => other,
        }
    }

    async fn advance(&self, customer: &Customer, invoice: Invoice) -> Result<ChargeOutcome> {
        let mut invoice = self.lifecycle.check_active(invoice).await?;
        let mut latest = self.ledger.latest(invoice.id).await?;
        let mut verified = false;

        let (invoice, transaction) = loop {
            match self.ledger.next_step(latest) {
                NextStep::StartAttempt => break self.ledger.start_attempt(&invoice).await?,
                NextStep::Settled(tx) => {
                    let verification = self.reconciler.verify(tx).await?;
                    return Ok(ChargeOutcome::AlreadySettled {
                        invoice: verification.invoice,
                        transaction: Some(verification.transaction),
                    });
                }
                NextStep::AwaitVerification(tx) if !verified => {
                    let verification = self.reconciler.verify(tx).await?;
                    verified = true;
                    if verification.status() != TransactionStatus::Success {
                        // The processor call may have outlived the invoice.
                        invoice = self.lifecycle.check_active(verification.invoice).await?;
                    }
                    latest = Some(verification.transaction);
                }
                NextStep::AwaitVerification(tx) => {
                    return Ok(ChargeOutcome::AwaitingVerification {
                        invoice,
                        transaction: tx,
                    });
                }
                NextStep::Blocked(tx) => return Err(TransactionLedger::blocked_error(&tx)),
            }
        };

        self.dispatch(customer, invoice, transaction).await
    }

    /// Hands the attempt to the processor. Never resolves the transaction:
    /// whatever happens here, it stays Pending until verified.
    async fn dispatch(
        &self,
        customer: &Customer,
        invoice: Invoice,
        transaction: Transaction,
    ) -> Result<ChargeOutcome> {
        match self.customers.card_for(customer.id).await? {
            Some(card) => {
                if let Err(e) = self
                    .processor
                    .charge(
                        &customer.email,
                        transaction.amount,
                        &card.auth_key,
                        &transaction.reference,
                    )
                    .await
                {
                    warn!(
                        transaction_id = %transaction.id,
                        reference = %transaction.reference,
                        error = %e,
                        "stored-card charge failed; attempt left pending"
                    );
                    return Err(e.into());
                }
                info!(transaction_id = %transaction.id, "stored card charged");
                Ok(ChargeOutcome::Submitted {
                    invoice,
                    transaction,
                })
            }
            None => {
                let url = match self
                    .processor
                    .initiate(&customer.email, transaction.amount, &transaction.reference)
                    .await
                {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(
                            transaction_id = %transaction.id,
                            reference = %transaction.reference,
                            error = %e,
                            "checkout initiation failed; attempt left pending"
                        );
                        return Err(e.into());
                    }
                };
                info!(transaction_id = %transaction.id, "hosted checkout initiated");
                Ok(ChargeOutcome::Redirect {
                    url,
                    invoice,
                    transaction,
                })
            }
        }
    }

    /// Reconciles the invoice's latest transaction with the processor.
    #[instrument(skip(self))]
    pub async fn verify_invoice(&self, invoice_id: Uuid) -> Result<Verification> {
        let invoice = self.lifecycle.get(invoice_id).await?;
        if invoice.status == InvoiceStatus::Draft {
            return Err(PaymentError::UnsupportedStateError(format!(
                "invoice {invoice_id} is a draft and has nothing to verify"
            )));
        }
        let tx = self.ledger.latest_attempt(invoice_id).await?;
        self.reconciler.verify(tx).await
    }

    /// Asks the processor to refund a paid invoice's settling transaction.
    /// Invoice and ledger records are left as they are.
    #[instrument(skip(self))]
    pub async fn refund(&self, invoice_id: Uuid) -> Result<Transaction> {
        let invoice = self.lifecycle.refresh(self.lifecycle.get(invoice_id).await?).await?;
        if invoice.status != InvoiceStatus::Paid {
            return Err(PaymentError::UnsupportedStateError(format!(
                "invoice {invoice_id} is {}; only paid invoices can be refunded",
                invoice.status
            )));
        }
        let tx = self.ledger.latest_attempt(invoice_id).await?;
        if tx.status != TransactionStatus::Success {
            return Err(PaymentError::ConflictError(format!(
                "latest attempt {} for paid invoice {invoice_id} is {}",
                tx.id, tx.status
            )));
        }
        self.processor.refund(&tx.reference).await?;
        info!(invoice_id = %invoice_id, transaction_id = %tx.id, "refund requested");
        Ok(tx)
    }

    pub fn webhook_signature_header(&self) -> &'static str {
        self.processor.webhook_signature_header()
    }

    /// Authenticates a processor webhook and reconciles the transaction it names.
    pub async fn handle_webhook(&self, signature: Option<&str>, body: &[u8]) -> Result<Verification> {
        let reference = self.processor.webhook_reference(signature, body)?;
        info!(reference = %reference, processor = self.processor.name(), "webhook received");
        self.reconciler.verify_reference(&reference).await
    }

    pub async fn invoice_summary(&self, invoice_id: Uuid) -> Result<InvoiceSummary> {
        let invoice = self.lifecycle.refresh(self.lifecycle.get(invoice_id).await?).await?;
        let transactions = self.ledger.history(invoice_id).await?;
        Ok(InvoiceSummary {
            invoice,
            transactions,
        })
    }

    /// Matching invoices with any due expiry applied.
    pub async fn invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        let mut invoices = Vec::new();
        for invoice in self.lifecycle.find(filter).await? {
            invoices.push(self.lifecycle.refresh(invoice).await?);
        }
        Ok(invoices)
    }
}
