//! Application layer containing the settlement state machines.
//!
//! [`orchestrator::ChargeOrchestrator`] is the entry point for charge and
//! verify requests. It drives the invoice state machine
//! ([`lifecycle::InvoiceLifecycle`]), the append-only attempt ledger
//! ([`ledger::TransactionLedger`]) and the single writer of transaction
//! outcomes ([`reconciler::VerificationReconciler`]). No lock is held across a
//! processor call; every write afterwards is conditional on the status read
//! before it.

pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod reconciler;
