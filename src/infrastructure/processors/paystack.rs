//! Paystack gateway adapter.
//!
//! All endpoints answer with an envelope `{ "status": bool, "message": .., "data": .. }`.
//! Amounts are sent in the smallest currency unit, exactly as stored.

use crate::domain::invoice::Amount;
use crate::domain::ports::{PaymentProcessor, ProcessorOutcome};
use crate::domain::transaction::Reference;
use crate::error::ProcessorError;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha512;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.paystack.co";
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    reference: String,
}

#[derive(Debug, Clone)]
pub struct PaystackProcessor {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl PaystackProcessor {
    pub fn new(secret_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, ProcessorError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<(StatusCode, Vec<u8>), ProcessorError> {
        let response = request.bearer_auth(&self.secret_key).send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProcessorError::Transport(format!(
                "paystack answered {status}"
            )));
        }
        Ok((status, body))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProcessorError> {
        let (status, body) = self.execute(request).await?;
        decode(status, &body)
    }
}

fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, ProcessorError> {
    let envelope: Envelope<T> = serde_json::from_slice(body)
        .map_err(|e| ProcessorError::Decode(format!("{status}: {e}")))?;
    if !status.is_success() || !envelope.status {
        return Err(ProcessorError::Rejected(envelope.message));
    }
    envelope
        .data
        .ok_or_else(|| ProcessorError::Decode("response carries no data".to_string()))
}

/// Maps a Paystack transaction status onto a processor outcome.
fn outcome_for(status: &str) -> ProcessorOutcome {
    match status {
        "success" => ProcessorOutcome::Success,
        "failed" => ProcessorOutcome::Failed,
        "abandoned" => ProcessorOutcome::Abandoned,
        "reversed" => ProcessorOutcome::Reversed,
        _ => ProcessorOutcome::Pending,
    }
}

#[async_trait]
impl PaymentProcessor for PaystackProcessor {
    fn name(&self) -> &'static str {
        "paystack"
    }

    async fn initiate(
        &self,
        email: &str,
        amount: Amount,
        reference: &Reference,
    ) -> Result<String, ProcessorError> {
        let request = self.client.post(self.url("/transaction/initialize")).json(&json!({
            "email": email,
            "amount": amount.value(),
            "reference": reference.as_str(),
        }));
        let data: InitializeData = self.send(request).await?;
        Ok(data.authorization_url)
    }

    async fn charge(
        &self,
        email: &str,
        amount: Amount,
        instrument_token: &str,
        reference: &Reference,
    ) -> Result<(), ProcessorError> {
        let request = self
            .client
            .post(self.url("/transaction/charge_authorization"))
            .json(&json!({
                "email": email,
                "amount": amount.value(),
                "authorization_code": instrument_token,
                "reference": reference.as_str(),
            }));
        let data: TransactionData = self.send(request).await?;
        debug!(reference = %reference, status = %data.status, "authorization charged");
        Ok(())
    }

    async fn verify(&self, reference: &Reference) -> Result<ProcessorOutcome, ProcessorError> {
        let request = self
            .client
            .get(self.url(&format!("/transaction/verify/{reference}")));
        // An unknown reference is a rejection, not a failed payment: the
        // attempt stays pending until the gateway reports on it.
        let data: TransactionData = self.send(request).await?;
        Ok(outcome_for(&data.status))
    }

    async fn refund(&self, reference: &Reference) -> Result<(), ProcessorError> {
        let request = self
            .client
            .post(self.url("/refund"))
            .json(&json!({ "transaction": reference.as_str() }));
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }

    fn webhook_signature_header(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    fn webhook_reference(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<Reference, ProcessorError> {
        let signature = signature
            .and_then(|s| hex::decode(s.trim()).ok())
            .ok_or(ProcessorError::InvalidSignature)?;
        let mut mac = HmacSha512::new_from_slice(self.secret_key.as_bytes())
            .map_err(|_| ProcessorError::InvalidSignature)?;
        mac.update(body);
        mac.verify_slice(&signature)
            .map_err(|_| ProcessorError::InvalidSignature)?;

        let event: WebhookEvent =
            serde_json::from_slice(body).map_err(|e| ProcessorError::Decode(e.to_string()))?;
        Ok(Reference::new(event.data.reference))
    }
}
