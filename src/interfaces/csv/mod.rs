pub mod customer_reader;
pub mod invoice_writer;

pub use customer_reader::{CustomerReader, CustomerRecord};
pub use invoice_writer::InvoiceWriter;
