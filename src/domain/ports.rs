use super::customer::{Card, Customer};
use super::invoice::{Amount, Invoice, InvoiceStatus};
use super::transaction::{Reference, Transaction, TransactionStatus};
use crate::error::{ProcessorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Lookup criteria for [`InvoiceStore::find`].
#[derive(Debug, Clone, PartialEq)]
pub enum InvoiceFilter {
    All,
    Customer(Uuid),
    IdempotencyKey { customer_id: Uuid, key: String },
}

impl InvoiceFilter {
    pub fn matches(&self, invoice: &Invoice) -> bool {
        match self {
            Self::All => true,
            Self::Customer(customer_id) => invoice.customer_id == *customer_id,
            Self::IdempotencyKey { customer_id, key } => {
                invoice.customer_id == *customer_id
                    && invoice.idempotency_key.as_deref() == Some(key.as_str())
            }
        }
    }
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn insert(&self, invoice: Invoice) -> Result<()>;
    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>>;
    /// Matching invoices, oldest first.
    async fn find(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>>;
    /// Replaces the stored invoice only if its status still equals `expected` and
    /// its revision equals `invoice.revision`. Returns the stored copy (revision bumped).
    async fn update_if_status(&self, invoice: Invoice, expected: InvoiceStatus)
    -> Result<Invoice>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts `tx` only if the invoice's most recent transaction is still
    /// `expected_latest` and the reference has never been used.
    async fn append(&self, tx: Transaction, expected_latest: Option<Uuid>) -> Result<()>;
    async fn get(&self, tx_id: Uuid) -> Result<Option<Transaction>>;
    async fn find_by_reference(&self, reference: &Reference) -> Result<Option<Transaction>>;
    /// The invoice's transactions ordered by sequence.
    async fn for_invoice(&self, invoice_id: Uuid) -> Result<Vec<Transaction>>;
    /// Replaces the stored transaction only if its status still equals `expected`.
    async fn update_if_status(&self, tx: Transaction, expected: TransactionStatus) -> Result<()>;
}

/// Read access to customer records owned by another part of the system.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn customer(&self, customer_id: Uuid) -> Result<Option<Customer>>;
    async fn card_for(&self, customer_id: Uuid) -> Result<Option<Card>>;
    async fn upsert_customer(&self, customer: Customer) -> Result<()>;
    async fn upsert_card(&self, card: Card) -> Result<()>;
}

pub trait ReferenceGenerator: Send + Sync {
    /// A fresh opaque token built from `length` bytes of entropy.
    fn generate(&self, length: usize) -> Reference;
}

/// What the processor reports for a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorOutcome {
    Success,
    Pending,
    Abandoned,
    Failed,
    Reversed,
}

/// A payment gateway. Providers differ in wire protocol only; the core drives
/// every one of them through this capability.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts a hosted checkout and returns the URL the customer must visit.
    async fn initiate(
        &self,
        email: &str,
        amount: Amount,
        reference: &Reference,
    ) -> std::result::Result<String, ProcessorError>;

    /// Charges a stored instrument.
    async fn charge(
        &self,
        email: &str,
        amount: Amount,
        instrument_token: &str,
        reference: &Reference,
    ) -> std::result::Result<(), ProcessorError>;

    async fn verify(
        &self,
        reference: &Reference,
    ) -> std::result::Result<ProcessorOutcome, ProcessorError>;

    async fn refund(&self, reference: &Reference) -> std::result::Result<(), ProcessorError>;

    /// Header carrying the webhook signature.
    fn webhook_signature_header(&self) -> &'static str {
        "x-signature"
    }

    /// Authenticates a webhook delivery and extracts the transaction reference it concerns.
    fn webhook_reference(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> std::result::Result<Reference, ProcessorError>;
}

pub type SharedInvoiceStore = Arc<dyn InvoiceStore>;
pub type SharedTransactionStore = Arc<dyn TransactionStore>;
pub type SharedCustomerDirectory = Arc<dyn CustomerDirectory>;
pub type SharedProcessor = Arc<dyn PaymentProcessor>;
