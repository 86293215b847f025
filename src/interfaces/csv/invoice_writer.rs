use crate::domain::invoice::Invoice;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

#[derive(Serialize)]
struct InvoiceRow<'a> {
    id: Uuid,
    customer_id: Uuid,
    amount: u64,
    status: &'a str,
    attempts: u32,
    expires_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    description: &'a str,
}

impl<'a> From<&'a Invoice> for InvoiceRow<'a> {
    fn from(invoice: &'a Invoice) -> Self {
        Self {
            id: invoice.id,
            customer_id: invoice.customer_id,
            amount: invoice.amount.value(),
            status: invoice.status.as_str(),
            attempts: invoice.attempts,
            expires_at: invoice.expires_at,
            paid_at: invoice.paid_at,
            description: &invoice.description,
        }
    }
}

/// Writes invoices as CSV, one row per invoice, with a header.
pub struct InvoiceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> InvoiceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_invoices<'a>(&mut self, invoices: impl IntoIterator<Item = &'a Invoice>) -> Result<()> {
        let mut empty = true;
        for invoice in invoices {
            self.writer.serialize(InvoiceRow::from(invoice))?;
            empty = false;
        }
        if empty {
            self.writer.write_record([
                "id",
                "customer_id",
                "amount",
                "status",
                "attempts",
                "expires_at",
                "paid_at",
                "description",
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
