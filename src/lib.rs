//! Invoice settlement against asynchronous payment processors.
//!
//! Invoices are issued for a customer and settled by one or more
//! transactions, each carrying a unique processor reference. A processor
//! reports outcomes asynchronously, so every attempt starts `Pending` and is
//! resolved only through verification. See [`application`] for the state
//! machines and [`infrastructure`] for the storage and gateway adapters.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
