//! Adapters for the domain ports: storage, reference generation and payment gateways.

pub mod in_memory;
pub mod processors;
pub mod reference;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

use crate::domain::ports::{SharedCustomerDirectory, SharedInvoiceStore, SharedTransactionStore};
use in_memory::{InMemoryCustomerDirectory, InMemoryInvoiceStore, InMemoryTransactionStore};
use std::sync::Arc;

/// The three storage ports, backed by one implementation.
#[derive(Clone)]
pub struct Stores {
    pub invoices: SharedInvoiceStore,
    pub transactions: SharedTransactionStore,
    pub customers: SharedCustomerDirectory,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            invoices: Arc::new(InMemoryInvoiceStore::new()),
            transactions: Arc::new(InMemoryTransactionStore::new()),
            customers: Arc::new(InMemoryCustomerDirectory::new()),
        }
    }

    #[cfg(feature = "storage-rocksdb")]
    pub fn rocksdb<P: AsRef<std::path::Path>>(path: P) -> crate::error::Result<Self> {
        let store = self::rocksdb::RocksDBStore::open(path)?;
        Ok(Self {
            invoices: Arc::new(store.clone()),
            transactions: Arc::new(store.clone()),
            customers: Arc::new(store),
        })
    }
}
