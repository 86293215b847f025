use super::in_memory::{check_invoice_immutables, check_transaction_immutables};
use crate::domain::customer::{Card, Customer};
use crate::domain::invoice::{Invoice, InvoiceStatus};
use crate::domain::ports::{CustomerDirectory, InvoiceFilter, InvoiceStore, TransactionStore};
use crate::domain::transaction::{Reference, Transaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for invoices, keyed by invoice id.
pub const CF_INVOICES: &str = "invoices";
/// Column Family mapping `customer_id ‖ idempotency key` to an invoice id.
pub const CF_INVOICE_KEYS: &str = "invoice_keys";
/// Column Family for transactions, keyed by transaction id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family mapping `invoice_id ‖ sequence (big endian)` to a transaction id.
pub const CF_LEDGER: &str = "ledger";
/// Column Family mapping a processor reference to a transaction id.
pub const CF_REFERENCES: &str = "references";
pub const CF_CUSTOMERS: &str = "customers";
/// Column Family for stored cards, keyed by customer id.
pub const CF_CARDS: &str = "cards";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_INVOICES,
    CF_INVOICE_KEYS,
    CF_TRANSACTIONS,
    CF_LEDGER,
    CF_REFERENCES,
    CF_CUSTOMERS,
    CF_CARDS,
];

/// A persistent store implementation using RocksDB.
///
/// Implements every storage port over one database. Conditional writes are
/// serialized by an async mutex so that the read-compare-write of
/// `update_if_status` and `append` is atomic within the process; multi-record
/// writes go through a single `WriteBatch`.
///
/// `Clone` shares the underlying `Arc<DB>` and the write lock.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating any
    /// missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::PersistenceError(format!("{name} column family not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_pinned_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_id(&self, cf: &str, key: &[u8]) -> Result<Option<Uuid>> {
        match self.db.get_pinned_cf(self.cf(cf)?, key)? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PaymentError::PersistenceError(format!("corrupt index entry: {e}"))),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        self.db.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Transaction ids recorded for an invoice, in sequence order.
    fn ledger_ids(&self, invoice_id: Uuid) -> Result<Vec<Uuid>> {
        let prefix = invoice_id.as_bytes();
        let iter = self
            .db
            .iterator_cf(self.cf(CF_LEDGER)?, IteratorMode::From(prefix.as_slice(), Direction::Forward));

        let mut ids = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let id = Uuid::from_slice(&value)
                .map_err(|e| PaymentError::PersistenceError(format!("corrupt ledger entry: {e}")))?;
            ids.push(id);
        }
        Ok(ids)
    }
}

fn idempotency_index_key(customer_id: Uuid, key: &str) -> Vec<u8> {
    let mut index = customer_id.as_bytes().to_vec();
    index.extend_from_slice(key.as_bytes());
    index
}

fn ledger_key(invoice_id: Uuid, sequence: u32) -> Vec<u8> {
    let mut key = invoice_id.as_bytes().to_vec();
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

#[async_trait]
impl InvoiceStore for RocksDBStore {
    async fn insert(&self, invoice: Invoice) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.db.get_pinned_cf(self.cf(CF_INVOICES)?, invoice.id.as_bytes())?.is_some() {
            return Err(PaymentError::ConflictError(format!(
                "invoice {} already exists",
                invoice.id
            )));
        }

        let mut batch = WriteBatch::default();
        if let Some(key) = &invoice.idempotency_key {
            let index = idempotency_index_key(invoice.customer_id, key);
            if self.read_id(CF_INVOICE_KEYS, &index)?.is_some() {
                return Err(PaymentError::ConflictError(format!(
                    "idempotency key {key} already used"
                )));
            }
            batch.put_cf(self.cf(CF_INVOICE_KEYS)?, index, invoice.id.as_bytes());
        }
        batch.put_cf(
            self.cf(CF_INVOICES)?,
            invoice.id.as_bytes(),
            serde_json::to_vec(&invoice)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>> {
        self.read(CF_INVOICES, invoice_id.as_bytes())
    }

    async fn find(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        if let InvoiceFilter::IdempotencyKey { customer_id, key } = filter {
            let index = idempotency_index_key(*customer_id, key);
            return match self.read_id(CF_INVOICE_KEYS, &index)? {
                Some(id) => Ok(InvoiceStore::get(self, id).await?.into_iter().collect()),
                None => Ok(Vec::new()),
            };
        }

        let mut invoices = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_INVOICES)?, IteratorMode::Start) {
            let (_key, value) = item?;
            let invoice: Invoice = serde_json::from_slice(&value)?;
            if filter.matches(&invoice) {
                invoices.push(invoice);
            }
        }
        invoices.sort_by_key(|invoice| invoice.created_at);
        Ok(invoices)
    }

    async fn update_if_status(&self, invoice: Invoice, expected: InvoiceStatus) -> Result<Invoice> {
        let _guard = self.write_lock.lock().await;
        let stored: Invoice = self
            .read(CF_INVOICES, invoice.id.as_bytes())?
            .ok_or_else(|| PaymentError::NotFoundError(format!("invoice {}", invoice.id)))?;
        if stored.status != expected || stored.revision != invoice.revision {
            return Err(PaymentError::ConflictError(format!(
                "invoice {} is {} at revision {}, expected {} at revision {}",
                stored.id, stored.status, stored.revision, expected, invoice.revision
            )));
        }
        check_invoice_immutables(&stored, &invoice)?;

        let mut next = invoice;
        next.revision += 1;
        self.write(CF_INVOICES, next.id.as_bytes(), &next)?;
        Ok(next)
    }
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn append(&self, tx: Transaction, expected_latest: Option<Uuid>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let latest = self.ledger_ids(tx.invoice_id)?.last().copied();
        if latest != expected_latest {
            return Err(PaymentError::ConflictError(format!(
                "invoice {} gained a newer transaction",
                tx.invoice_id
            )));
        }
        if self.read_id(CF_REFERENCES, tx.reference.as_str().as_bytes())?.is_some()
            || self.db.get_pinned_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes())?.is_some()
        {
            return Err(PaymentError::ConflictError(format!(
                "reference {} already used",
                tx.reference
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_TRANSACTIONS)?,
            tx.id.as_bytes(),
            serde_json::to_vec(&tx)?,
        );
        batch.put_cf(
            self.cf(CF_LEDGER)?,
            ledger_key(tx.invoice_id, tx.sequence),
            tx.id.as_bytes(),
        );
        batch.put_cf(
            self.cf(CF_REFERENCES)?,
            tx.reference.as_str().as_bytes(),
            tx.id.as_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, tx_id: Uuid) -> Result<Option<Transaction>> {
        self.read(CF_TRANSACTIONS, tx_id.as_bytes())
    }

    async fn find_by_reference(&self, reference: &Reference) -> Result<Option<Transaction>> {
        match self.read_id(CF_REFERENCES, reference.as_str().as_bytes())? {
            Some(id) => self.read(CF_TRANSACTIONS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn for_invoice(&self, invoice_id: Uuid) -> Result<Vec<Transaction>> {
        let mut history = Vec::new();
        for id in self.ledger_ids(invoice_id)? {
            if let Some(tx) = self.read(CF_TRANSACTIONS, id.as_bytes())? {
                history.push(tx);
            }
        }
        Ok(history)
    }

    async fn update_if_status(&self, tx: Transaction, expected: TransactionStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let stored: Transaction = self
            .read(CF_TRANSACTIONS, tx.id.as_bytes())?
            .ok_or_else(|| PaymentError::NotFoundError(format!("transaction {}", tx.id)))?;
        if stored.status != expected || stored.status == TransactionStatus::Success {
            return Err(PaymentError::ConflictError(format!(
                "transaction {} is {}, expected {}",
                stored.id, stored.status, expected
            )));
        }
        check_transaction_immutables(&stored, &tx)?;
        self.write(CF_TRANSACTIONS, tx.id.as_bytes(), &tx)
    }
}

#[async_trait]
impl CustomerDirectory for RocksDBStore {
    async fn customer(&self, customer_id: Uuid) -> Result<Option<Customer>> {
        self.read(CF_CUSTOMERS, customer_id.as_bytes())
    }

    async fn card_for(&self, customer_id: Uuid) -> Result<Option<Card>> {
        self.read(CF_CARDS, customer_id.as_bytes())
    }

    async fn upsert_customer(&self, customer: Customer) -> Result<()> {
        self.write(CF_CUSTOMERS, customer.id.as_bytes(), &customer)
    }

    async fn upsert_card(&self, card: Card) -> Result<()> {
        self.write(CF_CARDS, card.customer_id.as_bytes(), &card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::invoice::Amount;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn invoice(customer_id: Uuid) -> Invoice {
        let now = Utc::now();
        Invoice::issued(
            customer_id,
            Amount::new(500).unwrap(),
            "rent".to_string(),
            now,
            now + Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        for name in COLUMN_FAMILIES {
            assert!(store.db.cf_handle(name).is_some(), "missing {name}");
        }
    }

    #[tokio::test]
    async fn test_rocksdb_invoice_store() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let customer_id = Uuid::new_v4();
        let invoice = invoice(customer_id).with_idempotency_key(Some("order-1".to_string()));

        InvoiceStore::insert(&store, invoice.clone()).await.unwrap();
        assert_eq!(
            InvoiceStore::get(&store, invoice.id).await.unwrap(),
            Some(invoice.clone())
        );

        let by_key = store
            .find(&InvoiceFilter::IdempotencyKey {
                customer_id,
                key: "order-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(by_key, vec![invoice.clone()]);

        let mut paid = invoice.clone();
        paid.mark_paid(Utc::now()).unwrap();
        let stored = InvoiceStore::update_if_status(&store, paid.clone(), InvoiceStatus::Issued)
            .await
            .unwrap();
        assert_eq!(stored.revision, 1);
        assert!(matches!(
            InvoiceStore::update_if_status(&store, paid, InvoiceStatus::Issued).await,
            Err(PaymentError::ConflictError(_))
        ));
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_order_and_reopen() {
        let dir = tempdir().unwrap();
        let invoice_id = Uuid::new_v4();
        let amount = Amount::new(500).unwrap();
        let t1 = Transaction::pending(invoice_id, 1, amount, Reference::new("ref-1"), Utc::now());
        let t2 = Transaction::pending(invoice_id, 2, amount, Reference::new("ref-2"), Utc::now());

        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            store.append(t1.clone(), None).await.unwrap();
            assert!(matches!(
                store.append(t2.clone(), None).await,
                Err(PaymentError::ConflictError(_))
            ));
            store.append(t2.clone(), Some(t1.id)).await.unwrap();

            let failed = t1.resolved(TransactionStatus::Failed, Utc::now());
            TransactionStore::update_if_status(&store, failed, TransactionStatus::Pending)
                .await
                .unwrap();
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        let history = store.for_invoice(invoice_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, TransactionStatus::Failed);
        assert_eq!(history[1], t2);
        assert_eq!(
            store.find_by_reference(&Reference::new("ref-2")).await.unwrap(),
            Some(t2)
        );
        assert!(store.for_invoice(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rocksdb_customer_directory() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let customer = Customer {
            id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Obi".to_string(),
        };
        store.upsert_customer(customer.clone()).await.unwrap();
        store
            .upsert_card(Card {
                id: Uuid::new_v4(),
                customer_id: customer.id,
                auth_key: "AUTH_abc".to_string(),
                last_used: None,
            })
            .await
            .unwrap();

        assert_eq!(store.customer(customer.id).await.unwrap(), Some(customer.clone()));
        assert_eq!(
            store.card_for(customer.id).await.unwrap().unwrap().auth_key,
            "AUTH_abc"
        );
    }
}
