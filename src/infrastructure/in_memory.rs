use crate::domain::customer::{Card, Customer};
use crate::domain::invoice::{Invoice, InvoiceStatus};
use crate::domain::ports::{CustomerDirectory, InvoiceFilter, InvoiceStore, TransactionStore};
use crate::domain::transaction::{Reference, Transaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Fields that may not differ between a stored invoice and its replacement.
pub(crate) fn check_invoice_immutables(stored: &Invoice, next: &Invoice) -> Result<()> {
    let expiry_fixed = stored.expires_at.is_some() && stored.expires_at != next.expires_at;
    if stored.customer_id != next.customer_id || stored.amount != next.amount || expiry_fixed {
        return Err(PaymentError::ValidationError(format!(
            "invoice {} may not change customer, amount or expiry",
            stored.id
        )));
    }
    Ok(())
}

/// Fields that may not differ between a stored transaction and its replacement.
pub(crate) fn check_transaction_immutables(stored: &Transaction, next: &Transaction) -> Result<()> {
    if stored.invoice_id != next.invoice_id
        || stored.sequence != next.sequence
        || stored.amount != next.amount
        || stored.reference != next.reference
    {
        return Err(PaymentError::ValidationError(format!(
            "transaction {} may only change status",
            stored.id
        )));
    }
    Ok(())
}

#[derive(Default)]
struct InvoiceTable {
    invoices: HashMap<Uuid, Invoice>,
    order: Vec<Uuid>,
}

/// A thread-safe in-memory invoice store.
///
/// Conditional updates are checked and applied under one write lock.
#[derive(Default, Clone)]
pub struct InMemoryInvoiceStore {
    table: Arc<RwLock<InvoiceTable>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn insert(&self, invoice: Invoice) -> Result<()> {
        let mut table = self.table.write().await;
        if table.invoices.contains_key(&invoice.id) {
            return Err(PaymentError::ConflictError(format!(
                "invoice {} already exists",
                invoice.id
            )));
        }
        if let Some(key) = &invoice.idempotency_key {
            let filter = InvoiceFilter::IdempotencyKey {
                customer_id: invoice.customer_id,
                key: key.clone(),
            };
            if table.invoices.values().any(|existing| filter.matches(existing)) {
                return Err(PaymentError::ConflictError(format!(
                    "idempotency key {key} already used"
                )));
            }
        }
        table.order.push(invoice.id);
        table.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>> {
        let table = self.table.read().await;
        Ok(table.invoices.get(&invoice_id).cloned())
    }

    async fn find(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        let table = self.table.read().await;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.invoices.get(id))
            .filter(|invoice| filter.matches(invoice))
            .cloned()
            .collect())
    }

    async fn update_if_status(&self, invoice: Invoice, expected: InvoiceStatus) -> Result<Invoice> {
        let mut table = self.table.write().await;
        let stored = table
            .invoices
            .get_mut(&invoice.id)
            .ok_or_else(|| PaymentError::NotFoundError(format!("invoice {}", invoice.id)))?;
        if stored.status != expected || stored.revision != invoice.revision {
            return Err(PaymentError::ConflictError(format!(
                "invoice {} is {} at revision {}, expected {} at revision {}",
                stored.id, stored.status, stored.revision, expected, invoice.revision
            )));
        }
        check_invoice_immutables(stored, &invoice)?;
        let mut next = invoice;
        next.revision += 1;
        *stored = next.clone();
        Ok(next)
    }
}

#[derive(Default)]
struct Ledger {
    transactions: HashMap<Uuid, Transaction>,
    by_invoice: HashMap<Uuid, Vec<Uuid>>,
    by_reference: HashMap<Reference, Uuid>,
}

/// A thread-safe in-memory transaction store.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    ledger: Arc<RwLock<Ledger>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn append(&self, tx: Transaction, expected_latest: Option<Uuid>) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let latest = ledger
            .by_invoice
            .get(&tx.invoice_id)
            .and_then(|ids| ids.last().copied());
        if latest != expected_latest {
            return Err(PaymentError::ConflictError(format!(
                "invoice {} gained a newer transaction",
                tx.invoice_id
            )));
        }
        if ledger.by_reference.contains_key(&tx.reference)
            || ledger.transactions.contains_key(&tx.id)
        {
            return Err(PaymentError::ConflictError(format!(
                "reference {} already used",
                tx.reference
            )));
        }
        ledger.by_reference.insert(tx.reference.clone(), tx.id);
        ledger.by_invoice.entry(tx.invoice_id).or_default().push(tx.id);
        ledger.transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn get(&self, tx_id: Uuid) -> Result<Option<Transaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.transactions.get(&tx_id).cloned())
    }

    async fn find_by_reference(&self, reference: &Reference) -> Result<Option<Transaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .by_reference
            .get(reference)
            .and_then(|id| ledger.transactions.get(id))
            .cloned())
    }

    async fn for_invoice(&self, invoice_id: Uuid) -> Result<Vec<Transaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .by_invoice
            .get(&invoice_id)
            .into_iter()
            .flatten()
            .filter_map(|id| ledger.transactions.get(id))
            .cloned()
            .collect())
    }

    async fn update_if_status(&self, tx: Transaction, expected: TransactionStatus) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let stored = ledger
            .transactions
            .get_mut(&tx.id)
            .ok_or_else(|| PaymentError::NotFoundError(format!("transaction {}", tx.id)))?;
        if stored.status != expected || stored.status == TransactionStatus::Success {
            return Err(PaymentError::ConflictError(format!(
                "transaction {} is {}, expected {}",
                stored.id, stored.status, expected
            )));
        }
        check_transaction_immutables(stored, &tx)?;
        *stored = tx;
        Ok(())
    }
}

/// In-memory customers and their stored cards (one card per customer).
#[derive(Default, Clone)]
pub struct InMemoryCustomerDirectory {
    customers: Arc<RwLock<HashMap<Uuid, Customer>>>,
    cards: Arc<RwLock<HashMap<Uuid, Card>>>,
}

impl InMemoryCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CustomerDirectory for InMemoryCustomerDirectory {
    async fn customer(&self, customer_id: Uuid) -> Result<Option<Customer>> {
        let customers = self.customers.read().await;
        Ok(customers.get(&customer_id).cloned())
    }

    async fn card_for(&self, customer_id: Uuid) -> Result<Option<Card>> {
        let cards = self.cards.read().await;
        Ok(cards.get(&customer_id).cloned())
    }

    async fn upsert_customer(&self, customer: Customer) -> Result<()> {
        let mut customers = self.customers.write().await;
        customers.insert(customer.id, customer);
        Ok(())
    }

    async fn upsert_card(&self, card: Card) -> Result<()> {
        let mut cards = self.cards.write().await;
        cards.insert(card.customer_id, card);
        Ok(())
    }
}
