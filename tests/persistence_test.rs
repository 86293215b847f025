#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use paysettle::application::orchestrator::{ChargeCommand, ChargeOrchestrator, ChargeOutcome, Collaborators};
use paysettle::config::Settings;
use paysettle::domain::clock::SystemClock;
use paysettle::domain::customer::Customer;
use paysettle::domain::invoice::{Amount, InvoiceStatus};
use paysettle::domain::ports::ProcessorOutcome;
use paysettle::domain::transaction::TransactionStatus;
use paysettle::infrastructure::Stores;
use paysettle::infrastructure::processors::SandboxProcessor;
use paysettle::infrastructure::reference::RandomReferenceGenerator;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

fn orchestrator(stores: Stores, sandbox: &SandboxProcessor) -> ChargeOrchestrator {
    ChargeOrchestrator::new(
        Collaborators {
            invoices: stores.invoices,
            transactions: stores.transactions,
            customers: stores.customers,
            processor: Arc::new(sandbox.clone()),
            references: Arc::new(RandomReferenceGenerator),
            clock: Arc::new(SystemClock),
        },
        &Settings::default(),
    )
}

async fn seed_customer(path: &Path) -> Customer {
    let stores = Stores::rocksdb(path).unwrap();
    let customer = Customer {
        id: Uuid::new_v4(),
        email: "ada@example.com".to_string(),
        first_name: "Ada".to_string(),
        last_name: "Obi".to_string(),
    };
    stores.customers.upsert_customer(customer.clone()).await.unwrap();
    customer
}

#[tokio::test]
async fn test_pending_attempt_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");
    let customer = seed_customer(&db_path).await;
    let sandbox = SandboxProcessor::new();

    // 1. First process: issue and start an attempt, then shut down.
    let (invoice_id, reference) = {
        let orchestrator = orchestrator(Stores::rocksdb(&db_path).unwrap(), &sandbox);
        let outcome = orchestrator
            .charge(ChargeCommand::Initiate {
                customer_id: customer.id,
                amount: Amount::new(7_500).unwrap(),
                description: "annual plan".to_string(),
                idempotency_key: Some("plan-2024".to_string()),
                expires_at: None,
            })
            .await
            .unwrap();
        let ChargeOutcome::Redirect {
            invoice,
            transaction,
            ..
        } = outcome
        else {
            panic!("expected a redirect, got {outcome:?}");
        };
        (invoice.id, transaction.reference)
    };

    // 2. Second process: the keyed initiate finds the same invoice, verification settles it.
    let orchestrator = orchestrator(Stores::rocksdb(&db_path).unwrap(), &sandbox);
    let replay = orchestrator
        .charge(ChargeCommand::Initiate {
            customer_id: customer.id,
            amount: Amount::new(7_500).unwrap(),
            description: "annual plan".to_string(),
            idempotency_key: Some("plan-2024".to_string()),
            expires_at: None,
        })
        .await
        .unwrap();
    assert!(matches!(
        replay,
        ChargeOutcome::AwaitingVerification { ref invoice, .. } if invoice.id == invoice_id
    ));

    sandbox.script(&reference, [ProcessorOutcome::Success]);
    let verification = orchestrator.verify_invoice(invoice_id).await.unwrap();
    assert_eq!(verification.status(), TransactionStatus::Success);

    let summary = orchestrator.invoice_summary(invoice_id).await.unwrap();
    assert_eq!(summary.invoice.status, InvoiceStatus::Paid);
    assert_eq!(summary.invoice.attempts, 1);
    assert_eq!(summary.transactions.len(), 1);
    assert_eq!(summary.transactions[0].reference, reference);
}

#[tokio::test]
async fn test_imported_customers_persist() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");
    let customer_id = Uuid::new_v4();

    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "id,email,first_name,last_name,card_token").unwrap();
    writeln!(csv, "{customer_id},ngozi@example.com,Ngozi,Eze,AUTH_xyz").unwrap();

    let output = Command::new(cargo_bin!("paysettle"))
        .arg("import-customers")
        .arg(csv.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stores = Stores::rocksdb(&db_path).unwrap();
    let customer = stores.customers.customer(customer_id).await.unwrap().unwrap();
    assert_eq!(customer.email, "ngozi@example.com");
    let card = stores.customers.card_for(customer_id).await.unwrap().unwrap();
    assert_eq!(card.auth_key, "AUTH_xyz");
}
