//! Inbound adapters: the HTTP surface and CSV import/export.

pub mod csv;
pub mod http;
