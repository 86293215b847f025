//! JSON request surface over [`ChargeOrchestrator`].
//!
//! | Route                        | Operation                                  |
//! |------------------------------|--------------------------------------------|
//! | `POST /charge?mode=initiate` | issue (or re-find) an invoice and charge it |
//! | `POST /charge?mode=resume`   | continue settling an existing invoice      |
//! | `POST /verify/:invoice_id`   | reconcile the latest attempt               |
//! | `POST /refund/:invoice_id`   | refund a paid invoice at the processor     |
//! | `POST /webhook`              | processor event, signature checked         |
//! | `GET /invoices/:invoice_id`  | invoice and its transactions               |
//! | `GET /invoices?customer_id=` | a customer's invoices                      |
//! | `GET /health`                | liveness                                   |
//!
//! Orchestrator calls run on a spawned task: a client that disconnects
//! mid-request cannot cancel a charge between its processor call and the
//! writes that follow.

use crate::application::orchestrator::{ChargeCommand, ChargeOrchestrator, ChargeOutcome, InvoiceSummary};
use crate::application::reconciler::{InvoiceEffect, Verification};
use crate::domain::invoice::{Amount, Invoice};
use crate::domain::ports::InvoiceFilter;
use crate::domain::transaction::Transaction;
use crate::error::{PaymentError, ProcessorError};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<ChargeOrchestrator>,
}

/// An error rendered as `{"error": <code>, "message": <text>}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message: message.into(),
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(e: PaymentError) -> Self {
        let (status, code) = match &e {
            PaymentError::ValidationError(_) | PaymentError::CsvError(_) => {
                (StatusCode::BAD_REQUEST, "validation")
            }
            PaymentError::NotFoundError(_) => (StatusCode::NOT_FOUND, "not_found"),
            PaymentError::TerminalStateError { .. } => (StatusCode::CONFLICT, "terminal_state"),
            PaymentError::UnsupportedStateError(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unsupported_state")
            }
            PaymentError::ProcessorError(ProcessorError::InvalidSignature) => {
                (StatusCode::UNAUTHORIZED, "invalid_signature")
            }
            PaymentError::ProcessorError(ProcessorError::Decode(_)) => {
                (StatusCode::BAD_GATEWAY, "processor")
            }
            PaymentError::ProcessorError(ProcessorError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "processor_timeout")
            }
            PaymentError::ProcessorError(_) => (StatusCode::BAD_GATEWAY, "processor"),
            PaymentError::ConflictError(_) => (StatusCode::CONFLICT, "conflict"),
            PaymentError::PersistenceError(_) | PaymentError::IoError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "persistence")
            }
            PaymentError::ReconciliationRequired { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "reconciliation_required")
            }
        };
        if status.is_server_error() {
            error!(error = %e, "request failed");
        }
        Self {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs `work` to completion on its own task, whatever happens to the request.
async fn detach<T, F>(work: F) -> Result<T, ApiError>
where
    F: Future<Output = crate::error::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!(error = %e, "request task aborted");
            Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: "request task aborted".to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeMode {
    Initiate,
    Resume,
}

/// An unrecognised `mode` is refused by the query extractor itself.
#[derive(Debug, Deserialize)]
pub struct ChargeParams {
    mode: Option<ChargeMode>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeBody {
    customer_id: Uuid,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    invoice_id: Option<Uuid>,
}

impl ChargeBody {
    fn into_command(self, mode: ChargeMode) -> Result<ChargeCommand, ApiError> {
        match mode {
            ChargeMode::Initiate => {
                let amount = self
                    .amount
                    .ok_or_else(|| ApiError::bad_request("amount is required to initiate"))?;
                Ok(ChargeCommand::Initiate {
                    customer_id: self.customer_id,
                    amount: Amount::new(amount)?,
                    description: self.description.unwrap_or_default(),
                    idempotency_key: self.idempotency_key,
                    expires_at: self.expires_at,
                })
            }
            ChargeMode::Resume => {
                let invoice_id = self
                    .invoice_id
                    .ok_or_else(|| ApiError::bad_request("invoice_id is required to resume"))?;
                Ok(ChargeCommand::Resume {
                    customer_id: self.customer_id,
                    invoice_id,
                })
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    invoice: Invoice,
    transaction: Transaction,
    effect: InvoiceEffect,
    /// The processor has not decided; verifying again later is safe.
    retry_later: bool,
}

impl From<Verification> for VerifyResponse {
    fn from(verification: Verification) -> Self {
        Self {
            retry_later: verification.retry_later(),
            invoice: verification.invoice,
            transaction: verification.transaction,
            effect: verification.effect,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InvoiceQuery {
    customer_id: Uuid,
}

async fn charge(
    State(state): State<AppState>,
    Query(params): Query<ChargeParams>,
    Json(body): Json<ChargeBody>,
) -> ApiResult<ChargeOutcome> {
    let mode = params
        .mode
        .ok_or_else(|| ApiError::bad_request("mode query parameter is required"))?;
    let command = body.into_command(mode)?;
    let orchestrator = state.orchestrator.clone();
    let outcome = detach(async move { orchestrator.charge(command).await }).await?;
    Ok(Json(outcome))
}

async fn verify(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<VerifyResponse> {
    let orchestrator = state.orchestrator.clone();
    let verification = detach(async move { orchestrator.verify_invoice(invoice_id).await }).await?;
    Ok(Json(verification.into()))
}

async fn refund(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Transaction> {
    let orchestrator = state.orchestrator.clone();
    let tx = detach(async move { orchestrator.refund(invoice_id).await }).await?;
    Ok(Json(tx))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<VerifyResponse> {
    let header = state.orchestrator.webhook_signature_header();
    let signature = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let orchestrator = state.orchestrator.clone();
    let verification = detach(async move {
        orchestrator
            .handle_webhook(signature.as_deref(), &body)
            .await
    })
    .await
    .inspect_err(|e| warn!(status = %e.status, message = %e.message, "webhook rejected"))?;
    Ok(Json(verification.into()))
}

async fn invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<InvoiceSummary> {
    Ok(Json(state.orchestrator.invoice_summary(invoice_id).await?))
}

async fn invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoiceQuery>,
) -> ApiResult<Vec<Invoice>> {
    let filter = InvoiceFilter::Customer(query.customer_id);
    Ok(Json(state.orchestrator.invoices(&filter).await?))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(orchestrator: Arc<ChargeOrchestrator>) -> Router {
    let state = AppState { orchestrator };
    Router::new()
        .route("/charge", post(charge))
        .route("/verify/:invoice_id", post(verify))
        .route("/refund/:invoice_id", post(refund))
        .route("/webhook", post(webhook))
        .route("/invoices", get(invoices))
        .route("/invoices/:invoice_id", get(invoice))
        .route("/health", get(health))
        .with_state(state)
}

/// Serves `router` on `listener` until Ctrl-C.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
        })
        .await
}
