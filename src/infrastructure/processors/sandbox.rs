//! A scripted in-process gateway for local runs and tests.
//!
//! Outcomes are queued per reference; the last queued outcome repeats once the
//! queue is drained. Failures can be injected per operation and every call is
//! recorded in order.

use crate::domain::invoice::Amount;
use crate::domain::ports::{PaymentProcessor, ProcessorOutcome};
use crate::domain::transaction::Reference;
use crate::error::ProcessorError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxCall {
    Initiate { email: String, amount: Amount, reference: Reference },
    Charge { email: String, amount: Amount, token: String, reference: Reference },
    Verify(Reference),
    Refund(Reference),
}

/// Operations that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxOp {
    Initiate,
    Charge,
    Verify,
    Refund,
}

#[derive(Debug)]
struct SandboxState {
    outcomes: HashMap<Reference, VecDeque<ProcessorOutcome>>,
    default_outcome: ProcessorOutcome,
    failures: HashMap<SandboxOp, VecDeque<ProcessorError>>,
    calls: Vec<SandboxCall>,
}

/// Scripted [`PaymentProcessor`]. `Clone` shares the script and the call log.
#[derive(Debug, Clone)]
pub struct SandboxProcessor {
    state: Arc<Mutex<SandboxState>>,
}

impl Default for SandboxProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxProcessor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SandboxState {
                outcomes: HashMap::new(),
                default_outcome: ProcessorOutcome::Pending,
                failures: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Outcome reported for references with nothing queued.
    pub fn with_default_outcome(self, outcome: ProcessorOutcome) -> Self {
        self.lock().default_outcome = outcome;
        self
    }

    /// Queues the outcomes `verify` reports for `reference`, in order.
    pub fn script(&self, reference: &Reference, outcomes: impl IntoIterator<Item = ProcessorOutcome>) {
        self.lock()
            .outcomes
            .entry(reference.clone())
            .or_default()
            .extend(outcomes);
    }

    /// Makes the next call to `op` fail with `error`.
    pub fn fail_next(&self, op: SandboxOp, error: ProcessorError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    pub fn calls(&self) -> Vec<SandboxCall> {
        self.lock().calls.clone()
    }

    /// References that were handed to `initiate` or `charge`, in call order.
    pub fn submitted_references(&self) -> Vec<Reference> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SandboxCall::Initiate { reference, .. } | SandboxCall::Charge { reference, .. } => {
                    Some(reference.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, op: SandboxOp, call: SandboxCall) -> Result<(), ProcessorError> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct WebhookData {
    reference: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WebhookBody {
    Flat { reference: String },
    Event { data: WebhookData },
}

#[async_trait]
impl PaymentProcessor for SandboxProcessor {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn initiate(
        &self,
        email: &str,
        amount: Amount,
        reference: &Reference,
    ) -> Result<String, ProcessorError> {
        self.record(
            SandboxOp::Initiate,
            SandboxCall::Initiate {
                email: email.to_string(),
                amount,
                reference: reference.clone(),
            },
        )?;
        Ok(format!("sandbox://checkout/{reference}"))
    }

    async fn charge(
        &self,
        email: &str,
        amount: Amount,
        instrument_token: &str,
        reference: &Reference,
    ) -> Result<(), ProcessorError> {
        self.record(
            SandboxOp::Charge,
            SandboxCall::Charge {
                email: email.to_string(),
                amount,
                token: instrument_token.to_string(),
                reference: reference.clone(),
            },
        )
    }

    async fn verify(&self, reference: &Reference) -> Result<ProcessorOutcome, ProcessorError> {
        self.record(SandboxOp::Verify, SandboxCall::Verify(reference.clone()))?;
        let mut state = self.lock();
        let default_outcome = state.default_outcome;
        let outcome = match state.outcomes.get_mut(reference) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().copied(),
            None => None,
        };
        Ok(outcome.unwrap_or(default_outcome))
    }

    async fn refund(&self, reference: &Reference) -> Result<(), ProcessorError> {
        self.record(SandboxOp::Refund, SandboxCall::Refund(reference.clone()))
    }

    /// Sandbox webhooks are unsigned. The body is either `{"reference": ..}`
    /// or a gateway-style event `{"data": {"reference": ..}}`.
    fn webhook_reference(
        &self,
        _signature: Option<&str>,
        body: &[u8],
    ) -> Result<Reference, ProcessorError> {
        let parsed: WebhookBody =
            serde_json::from_slice(body).map_err(|e| ProcessorError::Decode(e.to_string()))?;
        let reference = match parsed {
            WebhookBody::Flat { reference } => reference,
            WebhookBody::Event { data } => data.reference,
        };
        Ok(Reference::new(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes_stick_on_last() {
        let sandbox = SandboxProcessor::new();
        let reference = Reference::new("abc");
        sandbox.script(
            &reference,
            [ProcessorOutcome::Pending, ProcessorOutcome::Success],
        );

        assert_eq!(sandbox.verify(&reference).await.unwrap(), ProcessorOutcome::Pending);
        assert_eq!(sandbox.verify(&reference).await.unwrap(), ProcessorOutcome::Success);
        assert_eq!(sandbox.verify(&reference).await.unwrap(), ProcessorOutcome::Success);
        assert_eq!(
            sandbox.verify(&Reference::new("other")).await.unwrap(),
            ProcessorOutcome::Pending
        );
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let sandbox = SandboxProcessor::new().with_default_outcome(ProcessorOutcome::Failed);
        let reference = Reference::new("abc");
        sandbox.fail_next(SandboxOp::Verify, ProcessorError::Transport("reset".into()));

        assert!(matches!(
            sandbox.verify(&reference).await,
            Err(ProcessorError::Transport(_))
        ));
        assert_eq!(sandbox.verify(&reference).await.unwrap(), ProcessorOutcome::Failed);
        assert_eq!(sandbox.calls().len(), 2);
    }

    #[test]
    fn test_webhook_body_shapes() {
        let sandbox = SandboxProcessor::new();
        assert_eq!(
            sandbox.webhook_reference(None, br#"{"reference":"r1"}"#).unwrap(),
            Reference::new("r1")
        );
        assert_eq!(
            sandbox
                .webhook_reference(None, br#"{"event":"charge.success","data":{"reference":"r2"}}"#)
                .unwrap(),
            Reference::new("r2")
        );
        assert!(matches!(
            sandbox.webhook_reference(None, b"nope"),
            Err(ProcessorError::Decode(_))
        ));
    }
}
