use crate::domain::invoice::InvoiceStatus;
use miette::Diagnostic;
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a payment processor adapter.
///
/// None of these imply that money did or did not move: callers leave the
/// transaction `Pending` and reconcile later.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("processor did not answer within {0:?}; outcome unknown, transaction stays pending")]
    Timeout(std::time::Duration),
    #[error("processor rejected the request: {0}")]
    Rejected(String),
    #[error("unreadable processor response: {0}")]
    Decode(String),
    #[error("webhook signature is invalid")]
    InvalidSignature,
    #[error("operation not supported by {0}")]
    Unsupported(&'static str),
}

impl ProcessorError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for ProcessorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum PaymentError {
    #[error("validation error: {0}")]
    #[diagnostic(code(paysettle::validation))]
    ValidationError(String),

    #[error("not found: {0}")]
    #[diagnostic(code(paysettle::not_found))]
    NotFoundError(String),

    #[error("invoice {invoice_id} is already resolved ({status})")]
    #[diagnostic(code(paysettle::terminal_state))]
    TerminalStateError {
        invoice_id: Uuid,
        status: InvoiceStatus,
    },

    #[error("unsupported state: {0}")]
    #[diagnostic(code(paysettle::unsupported_state))]
    UnsupportedStateError(String),

    #[error(transparent)]
    #[diagnostic(code(paysettle::processor))]
    ProcessorError(#[from] ProcessorError),

    #[error("conflict: {0}")]
    #[diagnostic(
        code(paysettle::conflict),
        help("re-read the record and retry the operation")
    )]
    ConflictError(String),

    #[error("persistence error: {0}")]
    #[diagnostic(code(paysettle::persistence))]
    PersistenceError(String),

    #[error("transaction {transaction_id} settled but invoice {invoice_id} could not be marked paid")]
    #[diagnostic(
        code(paysettle::reconciliation_required),
        help("verify the invoice again; the settled transaction is authoritative")
    )]
    ReconciliationRequired {
        invoice_id: Uuid,
        transaction_id: Uuid,
    },

    #[error("CSV error: {0}")]
    #[diagnostic(code(paysettle::csv))]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(paysettle::io))]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        Self::PersistenceError(format!("serialization error: {e}"))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(e: rocksdb::Error) -> Self {
        Self::PersistenceError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
