#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use paysettle::application::orchestrator::{ChargeCommand, ChargeOrchestrator, ChargeOutcome, Collaborators};
use paysettle::config::Settings;
use paysettle::domain::clock::ManualClock;
use paysettle::domain::customer::{Card, Customer};
use paysettle::domain::invoice::{Amount, Invoice};
use paysettle::domain::ports::SharedProcessor;
use paysettle::domain::transaction::Transaction;
use paysettle::infrastructure::Stores;
use paysettle::infrastructure::processors::SandboxProcessor;
use paysettle::infrastructure::reference::RandomReferenceGenerator;
use std::sync::Arc;
use uuid::Uuid;

/// An orchestrator over in-memory stores, a manual clock and the scripted sandbox gateway.
pub struct Harness {
    pub orchestrator: Arc<ChargeOrchestrator>,
    pub sandbox: SandboxProcessor,
    pub clock: ManualClock,
    pub stores: Stores,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self::with_processor(settings, |sandbox, _| Arc::new(sandbox.clone()))
    }

    /// Wires the orchestrator to a processor built around the harness's sandbox and clock.
    pub fn with_processor(
        settings: Settings,
        processor: impl FnOnce(&SandboxProcessor, &ManualClock) -> SharedProcessor,
    ) -> Self {
        let stores = Stores::in_memory();
        let sandbox = SandboxProcessor::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        let orchestrator = ChargeOrchestrator::new(
            Collaborators {
                invoices: stores.invoices.clone(),
                transactions: stores.transactions.clone(),
                customers: stores.customers.clone(),
                processor: processor(&sandbox, &clock),
                references: Arc::new(RandomReferenceGenerator),
                clock: Arc::new(clock.clone()),
            },
            &settings,
        );
        Self {
            orchestrator: Arc::new(orchestrator),
            sandbox,
            clock,
            stores,
        }
    }

    pub async fn add_customer(&self) -> Customer {
        let id = Uuid::new_v4();
        let customer = Customer {
            id,
            email: format!("{}@example.com", &id.simple().to_string()[..8]),
            first_name: "Ada".to_string(),
            last_name: "Obi".to_string(),
        };
        self.stores
            .customers
            .upsert_customer(customer.clone())
            .await
            .unwrap();
        customer
    }

    pub async fn add_customer_with_card(&self, token: &str) -> Customer {
        let customer = self.add_customer().await;
        self.stores
            .customers
            .upsert_card(Card {
                id: Uuid::new_v4(),
                customer_id: customer.id,
                auth_key: token.to_string(),
                last_used: None,
            })
            .await
            .unwrap();
        customer
    }
}

pub fn initiate(customer_id: Uuid, amount: u64) -> ChargeCommand {
    ChargeCommand::Initiate {
        customer_id,
        amount: Amount::new(amount).unwrap(),
        description: "test invoice".to_string(),
        idempotency_key: None,
        expires_at: None,
    }
}

pub fn resume(customer_id: Uuid, invoice_id: Uuid) -> ChargeCommand {
    ChargeCommand::Resume {
        customer_id,
        invoice_id,
    }
}

/// The invoice and transaction any outcome carries.
pub fn parts(outcome: &ChargeOutcome) -> (Invoice, Option<Transaction>) {
    match outcome {
        ChargeOutcome::Redirect {
            invoice,
            transaction,
            ..
        }
        | ChargeOutcome::Submitted {
            invoice,
            transaction,
        }
        | ChargeOutcome::AwaitingVerification {
            invoice,
            transaction,
        } => (invoice.clone(), Some(transaction.clone())),
        ChargeOutcome::AlreadySettled {
            invoice,
            transaction,
        } => (invoice.clone(), transaction.clone()),
    }
}
