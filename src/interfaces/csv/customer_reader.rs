use crate::domain::customer::{Card, Customer};
use crate::error::{PaymentError, Result};
use serde::Deserialize;
use std::io::Read;
use uuid::Uuid;

/// One row of a customer import file.
///
/// `card_token` is the processor-issued authorization for a stored card and
/// may be left empty.
#[derive(Debug, Deserialize)]
struct CustomerRow {
    id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    #[serde(default)]
    card_token: Option<String>,
}

/// A customer together with the card to store for them, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRecord {
    pub customer: Customer,
    pub card: Option<Card>,
}

impl TryFrom<CustomerRow> for CustomerRecord {
    type Error = PaymentError;

    fn try_from(row: CustomerRow) -> Result<Self> {
        if !row.email.contains('@') {
            return Err(PaymentError::ValidationError(format!(
                "customer {} has an invalid email '{}'",
                row.id, row.email
            )));
        }
        let card = row
            .card_token
            .filter(|token| !token.is_empty())
            .map(|auth_key| Card {
                id: Uuid::new_v4(),
                customer_id: row.id,
                auth_key,
                last_used: None,
            });
        Ok(Self {
            customer: Customer {
                id: row.id,
                email: row.email,
                first_name: row.first_name,
                last_name: row.last_name,
            },
            card,
        })
    }
}

/// Reads customers (and optional stored cards) from a CSV source.
///
/// Expected header: `id, email, first_name, last_name, card_token`.
pub struct CustomerReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CustomerReader<R> {
    /// Creates a new `CustomerReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and validates customer rows.
    pub fn customers(self) -> impl Iterator<Item = Result<CustomerRecord>> {
        self.reader.into_deserialize().map(|result| {
            result
                .map_err(PaymentError::from)
                .and_then(|row: CustomerRow| CustomerRecord::try_from(row))
        })
    }
}
