use super::lifecycle::InvoiceLifecycle;
use crate::config::{AbandonedPolicy, Settings};
use crate::domain::clock::Clock;
use crate::domain::invoice::Invoice;
use crate::domain::ports::{ReferenceGenerator, SharedTransactionStore};
use crate::domain::transaction::{Reference, Transaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What the latest attempt allows the caller to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    /// No attempt yet, or the latest one failed.
    StartAttempt,
    AwaitVerification(Transaction),
    Settled(Transaction),
    /// The latest attempt was abandoned and the policy forbids retrying.
    Blocked(Transaction),
}

/// Append-only record of settlement attempts, one ordered sequence per invoice.
pub struct TransactionLedger {
    transactions: SharedTransactionStore,
    lifecycle: Arc<InvoiceLifecycle>,
    references: Arc<dyn ReferenceGenerator>,
    clock: Arc<dyn Clock>,
    reference_bytes: usize,
    abandoned_policy: AbandonedPolicy,
}

impl TransactionLedger {
    pub fn new(
        transactions: SharedTransactionStore,
        lifecycle: Arc<InvoiceLifecycle>,
        references: Arc<dyn ReferenceGenerator>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        Self {
            transactions,
            lifecycle,
            references,
            clock,
            reference_bytes: settings.reference_bytes,
            abandoned_policy: settings.abandoned_policy,
        }
    }

    pub async fn history(&self, invoice_id: Uuid) -> Result<Vec<Transaction>> {
        self.transactions.for_invoice(invoice_id).await
    }

    pub async fn latest(&self, invoice_id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.history(invoice_id).await?.pop())
    }

    pub async fn latest_attempt(&self, invoice_id: Uuid) -> Result<Transaction> {
        self.latest(invoice_id).await?.ok_or_else(|| {
            PaymentError::NotFoundError(format!("no transaction for invoice {invoice_id}"))
        })
    }

    pub async fn get(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.transactions
            .get(transaction_id)
            .await?
            .ok_or_else(|| PaymentError::NotFoundError(format!("transaction {transaction_id}")))
    }

    pub async fn by_reference(&self, reference: &Reference) -> Result<Transaction> {
        self.transactions
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| PaymentError::NotFoundError(format!("transaction reference {reference}")))
    }

    pub fn next_step(&self, latest: Option<Transaction>) -> NextStep {
        match latest {
            None => NextStep::StartAttempt,
            Some(tx) => match tx.status {
                TransactionStatus::Failed => NextStep::StartAttempt,
                TransactionStatus::Abandoned => match self.abandoned_policy {
                    AbandonedPolicy::Retryable => NextStep::StartAttempt,
                    AbandonedPolicy::Terminal => NextStep::Blocked(tx),
                },
                TransactionStatus::Pending => NextStep::AwaitVerification(tx),
                TransactionStatus::Success => NextStep::Settled(tx),
            },
        }
    }

    pub fn blocked_error(tx: &Transaction) -> PaymentError {
        PaymentError::UnsupportedStateError(format!(
            "attempt {} for invoice {} was abandoned; no automatic retry is configured",
            tx.id, tx.invoice_id
        ))
    }

    /// Opens a new Pending attempt for an Issued invoice.
    ///
    /// Only allowed when there is no attempt yet or the latest one failed.
    /// The superseded transaction is left untouched. Returns the invoice with
    /// its attempt bookkeeping updated alongside the new transaction.
    pub async fn start_attempt(&self, invoice: &Invoice) -> Result<(Invoice, Transaction)> {
        let latest = self.latest(invoice.id).await?;
        let expected_latest = latest.as_ref().map(|tx| tx.id);
        let sequence = latest.as_ref().map_or(1, |tx| tx.sequence + 1);

        match self.next_step(latest) {
            NextStep::StartAttempt => {}
            NextStep::AwaitVerification(tx) => {
                return Err(PaymentError::ConflictError(format!(
                    "attempt {} is still pending; verify it before charging again",
                    tx.id
                )));
            }
            NextStep::Settled(tx) => {
                return Err(PaymentError::ConflictError(format!(
                    "invoice {} was settled by {}",
                    tx.invoice_id, tx.id
                )));
            }
            NextStep::Blocked(tx) => return Err(Self::blocked_error(&tx)),
        }

        // The invoice claim comes first so a terminal or expired invoice never
        // gains a transaction; the conditional append then guards the ledger.
        let invoice = self.lifecycle.claim_attempt(invoice, sequence).await?;
        let reference = self.references.generate(self.reference_bytes);
        let tx = Transaction::pending(
            invoice.id,
            sequence,
            invoice.amount,
            reference,
            self.clock.now(),
        );
        if let Err(e) = self.transactions.append(tx.clone(), expected_latest).await {
            warn!(invoice_id = %invoice.id, sequence, error = %e, "attempt not appended");
            self.lifecycle.release_attempt(&invoice, sequence).await;
            return Err(e);
        }

        info!(
            invoice_id = %invoice.id,
            transaction_id = %tx.id,
            reference = %tx.reference,
            attempt = invoice.attempts,
            "settlement attempt started"
        );
        Ok((invoice, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lifecycle::IssueRequest;
    use crate::domain::clock::ManualClock;
    use crate::domain::customer::Customer;
    use crate::domain::invoice::{Amount, InvoiceStatus};
    use crate::domain::ports::{CustomerDirectory, TransactionStore};
    use crate::infrastructure::in_memory::{
        InMemoryCustomerDirectory, InMemoryInvoiceStore, InMemoryTransactionStore,
    };
    use crate::infrastructure::reference::RandomReferenceGenerator;
    use chrono::Utc;

    struct Fixture {
        ledger: TransactionLedger,
        clock: ManualClock,
        lifecycle: Arc<InvoiceLifecycle>,
        transactions: InMemoryTransactionStore,
        invoice: Invoice,
    }

    async fn fixture(policy: AbandonedPolicy) -> Fixture {
        let manual = ManualClock::new(Utc::now());
        let clock: Arc<dyn Clock> = Arc::new(manual.clone());
        let settings = Settings {
            abandoned_policy: policy,
            ..Settings::default()
        };
        let customers = InMemoryCustomerDirectory::new();
        let customer_id = Uuid::new_v4();
        customers
            .upsert_customer(Customer {
                id: customer_id,
                email: "ada@example.com".to_string(),
                first_name: "Ada".to_string(),
                last_name: "Obi".to_string(),
            })
            .await
            .unwrap();
        let lifecycle = Arc::new(InvoiceLifecycle::new(
            Arc::new(InMemoryInvoiceStore::new()),
            Arc::new(customers),
            clock.clone(),
            &settings,
        ));
        let transactions = InMemoryTransactionStore::new();
        let ledger = TransactionLedger::new(
            Arc::new(transactions.clone()),
            lifecycle.clone(),
            Arc::new(RandomReferenceGenerator),
            clock,
            &settings,
        );
        let invoice = lifecycle
            .ensure_issued(IssueRequest {
                customer_id,
                amount: Amount::new(5000).unwrap(),
                description: "order".to_string(),
                expires_at: None,
                idempotency_key: None,
            })
            .await
            .unwrap();
        Fixture {
            ledger,
            clock: manual,
            lifecycle,
            transactions,
            invoice,
        }
    }

    async fn fail(transactions: &InMemoryTransactionStore, tx: &Transaction, status: TransactionStatus) {
        transactions
            .update_if_status(tx.resolved(status, Utc::now()), TransactionStatus::Pending)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_latest_attempt_not_found() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        assert!(matches!(
            f.ledger.latest_attempt(f.invoice.id).await,
            Err(PaymentError::NotFoundError(_))
        ));
    }

    #[tokio::test]
    async fn test_first_attempt() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        let (invoice, tx) = f.ledger.start_attempt(&f.invoice).await.unwrap();

        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.sequence, 1);
        assert_eq!(tx.amount, f.invoice.amount);
        assert_eq!(invoice.attempts, 1);
        assert_eq!(f.ledger.latest_attempt(invoice.id).await.unwrap(), tx);
    }

    #[tokio::test]
    async fn test_pending_blocks_new_attempt() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        let (invoice, _) = f.ledger.start_attempt(&f.invoice).await.unwrap();
        assert!(matches!(
            f.ledger.start_attempt(&invoice).await,
            Err(PaymentError::ConflictError(_))
        ));
        assert_eq!(f.ledger.history(invoice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_failure() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        let (invoice, t1) = f.ledger.start_attempt(&f.invoice).await.unwrap();
        fail(&f.transactions, &t1, TransactionStatus::Failed).await;

        let (invoice, t2) = f.ledger.start_attempt(&invoice).await.unwrap();
        assert_ne!(t1.reference, t2.reference);
        assert_eq!(t2.sequence, 2);
        assert_eq!(invoice.attempts, 2);

        let history = f.ledger.history(invoice.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, t1.id);
        assert_eq!(history[0].status, TransactionStatus::Failed);
        assert_eq!(history[0].reference, t1.reference);
    }

    #[tokio::test]
    async fn test_stale_invoice_cannot_start_twice() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        let (_, t1) = f.ledger.start_attempt(&f.invoice).await.unwrap();
        fail(&f.transactions, &t1, TransactionStatus::Failed).await;

        let stale = f.lifecycle.get(f.invoice.id).await.unwrap();
        f.ledger.start_attempt(&stale).await.unwrap();
        // Same snapshot again: the latest is now Pending.
        assert!(f.ledger.start_attempt(&stale).await.is_err());
        assert_eq!(f.ledger.history(stale.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_invoice_gains_no_attempt() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        let (invoice, t1) = f.ledger.start_attempt(&f.invoice).await.unwrap();
        fail(&f.transactions, &t1, TransactionStatus::Failed).await;
        f.lifecycle.cancel(invoice.id).await.unwrap();

        // The caller still holds the Issued copy read before the cancel.
        assert!(matches!(
            f.ledger.start_attempt(&invoice).await,
            Err(PaymentError::TerminalStateError {
                status: InvoiceStatus::Cancelled,
                ..
            })
        ));
        assert_eq!(f.ledger.history(invoice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_invoice_gains_no_attempt() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        f.clock.advance(chrono::Duration::hours(25));

        assert!(matches!(
            f.ledger.start_attempt(&f.invoice).await,
            Err(PaymentError::TerminalStateError {
                status: InvoiceStatus::Expired,
                ..
            })
        ));
        assert!(f.ledger.history(f.invoice.id).await.unwrap().is_empty());
        assert_eq!(f.lifecycle.get(f.invoice.id).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_abandoned_policy() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        let (invoice, t1) = f.ledger.start_attempt(&f.invoice).await.unwrap();
        fail(&f.transactions, &t1, TransactionStatus::Abandoned).await;
        assert!(matches!(
            f.ledger.start_attempt(&invoice).await,
            Err(PaymentError::UnsupportedStateError(_))
        ));

        let f = fixture(AbandonedPolicy::Retryable).await;
        let (invoice, t1) = f.ledger.start_attempt(&f.invoice).await.unwrap();
        fail(&f.transactions, &t1, TransactionStatus::Abandoned).await;
        let (_, t2) = f.ledger.start_attempt(&invoice).await.unwrap();
        assert_eq!(t2.sequence, 2);
    }

    #[tokio::test]
    async fn test_by_reference() {
        let f = fixture(AbandonedPolicy::Terminal).await;
        let (_, tx) = f.ledger.start_attempt(&f.invoice).await.unwrap();
        assert_eq!(f.ledger.by_reference(&tx.reference).await.unwrap().id, tx.id);
        assert!(f.ledger.by_reference(&Reference::new("nope")).await.is_err());
    }
}
