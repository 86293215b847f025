mod common;

use common::{Harness, initiate, parts, resume};
use paysettle::application::orchestrator::ChargeOutcome;
use paysettle::application::reconciler::InvoiceEffect;
use paysettle::domain::invoice::InvoiceStatus;
use paysettle::domain::ports::ProcessorOutcome;
use paysettle::domain::transaction::TransactionStatus;
use paysettle::error::PaymentError;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_verifies_settle_exactly_once() {
    let h = Harness::new();
    let customer = h.add_customer().await;
    let (invoice, tx) = parts(&h.orchestrator.charge(initiate(customer.id, 10_000)).await.unwrap());
    let tx = tx.unwrap();
    h.sandbox.script(&tx.reference, [ProcessorOutcome::Success]);

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let orchestrator = h.orchestrator.clone();
        let invoice_id = invoice.id;
        set.spawn(async move { orchestrator.verify_invoice(invoice_id).await });
    }

    let mut settled = 0;
    while let Some(joined) = set.join_next().await {
        let verification = joined.unwrap().unwrap();
        assert_eq!(verification.status(), TransactionStatus::Success);
        assert_eq!(verification.invoice.status, InvoiceStatus::Paid);
        if matches!(verification.effect, InvoiceEffect::Settled { .. }) {
            settled += 1;
        }
    }
    assert_eq!(settled, 1);

    let summary = h.orchestrator.invoice_summary(invoice.id).await.unwrap();
    assert_eq!(summary.invoice.status, InvoiceStatus::Paid);
    assert_eq!(summary.transactions.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resumes_start_one_attempt() {
    let h = Harness::new();
    let customer = h.add_customer().await;
    let (invoice, tx) = parts(&h.orchestrator.charge(initiate(customer.id, 10_000)).await.unwrap());
    h.sandbox.script(&tx.unwrap().reference, [ProcessorOutcome::Failed]);

    let mut set = JoinSet::new();
    for _ in 0..12 {
        let orchestrator = h.orchestrator.clone();
        let (customer_id, invoice_id) = (customer.id, invoice.id);
        set.spawn(async move { orchestrator.charge(resume(customer_id, invoice_id)).await });
    }

    let mut redirects = 0;
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(ChargeOutcome::Redirect { .. }) => redirects += 1,
            Ok(ChargeOutcome::AwaitingVerification { .. }) | Err(PaymentError::ConflictError(_)) => {}
            other => panic!("unexpected resume result: {other:?}"),
        }
    }
    assert_eq!(redirects, 1);

    let summary = h.orchestrator.invoice_summary(invoice.id).await.unwrap();
    assert_eq!(summary.invoice.attempts, 2);
    assert_eq!(summary.transactions.len(), 2);
    assert_eq!(summary.transactions[1].status, TransactionStatus::Pending);
    assert_eq!(h.sandbox.submitted_references().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initiates_with_one_key_share_an_invoice() {
    let h = Harness::new();
    let customer = h.add_customer().await;

    let mut set = JoinSet::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        let customer_id = customer.id;
        set.spawn(async move {
            orchestrator
                .charge(paysettle::application::orchestrator::ChargeCommand::Initiate {
                    customer_id,
                    amount: paysettle::domain::invoice::Amount::new(500).unwrap(),
                    description: "subscription".to_string(),
                    idempotency_key: Some("sub-1".to_string()),
                    expires_at: None,
                })
                .await
        });
    }

    let mut invoice_ids = std::collections::HashSet::new();
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(outcome) => {
                invoice_ids.insert(parts(&outcome).0.id);
            }
            Err(PaymentError::ConflictError(_)) => {}
            Err(e) => panic!("unexpected initiate error: {e:?}"),
        }
    }
    assert_eq!(invoice_ids.len(), 1);

    let invoice_id = *invoice_ids.iter().next().unwrap();
    let history = h.orchestrator.ledger().history(invoice_id).await.unwrap();
    assert_eq!(history.len(), 1);
}
