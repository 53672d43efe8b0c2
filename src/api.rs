// src/api.rs
//! HTTP surface: relay, account-abstraction and paid-play routes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::builder::{CallRequest, OperationBuilder, TransferRequest};
use crate::content::ContentProvider;
use crate::error::FacilitatorError;
use crate::negotiator::PaymentNegotiator;
use crate::relayer::{MetaTxRelayer, RelayRequest};
use crate::submitter::OperationSubmitter;
use crate::tokens::{TokenSymbol, USDC_ADDRESS};
use crate::types::{SubmissionReport, TxStatus};
use crate::user_op::UserOperation;

const SUPPORTED_NETWORK: &str = "base-sepolia";

/// Bundler-backed components; absent without a bundler API key.
pub struct AccountAbstraction {
    pub builder: OperationBuilder,
    pub submitter: OperationSubmitter,
}

pub struct AppState {
    pub relayer: MetaTxRelayer,
    pub account_abstraction: Option<AccountAbstraction>,
    pub negotiator: PaymentNegotiator,
    pub content: Arc<dyn ContentProvider>,
}

impl AppState {
    fn account_abstraction(&self) -> Result<&AccountAbstraction, FacilitatorError> {
        self.account_abstraction.as_ref().ok_or_else(|| {
            FacilitatorError::NotConfigured("Set PAYMASTER_PIMLICO_API_KEY to enable the bundler".to_string())
        })
    }
}

type ApiResult<T = Json<Value>> = Result<T, FacilitatorError>;

impl IntoResponse for FacilitatorError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match &self {
            FacilitatorError::ConfirmationTimeout(tx_hash) => json!({
                "success": true,
                "transactionHash": tx_hash,
                "status": TxStatus::Pending,
            }),
            FacilitatorError::BundlerRejected(message) => json!({
                "error": "Bundler rejected UserOperation",
                "details": message,
            }),
            FacilitatorError::UpstreamUnavailable(message) => json!({
                "error": "Upstream unavailable",
                "details": message,
            }),
            other => json!({ "error": other.to_string() }),
        };

        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        (status, Json(body)).into_response()
    }
}

/// Request bodies are read as raw bytes so malformed JSON, or a missing
/// content type, still answers with the `{error}` body.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, FacilitatorError> {
    serde_json::from_slice(body)
        .map_err(|e| FacilitatorError::BadRequest(format!("Invalid JSON body: {}", e)))
}

fn parse_value<T: DeserializeOwned>(value: Value) -> Result<T, FacilitatorError> {
    serde_json::from_value(value).map_err(|e| FacilitatorError::BadRequest(e.to_string()))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/facilitator/erc3009",
            get(erc3009_status).post(erc3009_relay),
        )
        .route("/api/facilitator/prepare", post(prepare))
        .route("/api/facilitator/submit", post(submit))
        .route("/api/facilitator", get(bundler_status).post(network_submit))
        .route("/api/gacha", get(gacha_requirements).post(gacha_play))
        .route("/api/gacha/passkey", get(passkey_info).post(passkey_play))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ERC-3009 relay

async fn erc3009_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.relayer.address() {
        Some(address) => Json(json!({
            "configured": true,
            "address": address,
            "network": "multi-chain",
        })),
        None => Json(json!({
            "configured": false,
            "network": "multi-chain",
            "message": "FACILITATOR_PRIVATE_KEY not set",
        })),
    }
}

async fn erc3009_relay(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request: RelayRequest = parse_body(&body)?;
    let receipt = state.relayer.relay_request(request).await?;

    Ok(Json(json!({
        "success": true,
        "transactionHash": receipt.transaction_hash,
        "blockNumber": receipt.block_number.to_string(),
        "status": receipt.status,
    })))
}

// Account abstraction

async fn prepare(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request: TransferRequest = parse_body(&body)?;
    let (sender, to, amount) = (request.sender, request.to, request.amount.clone());

    let prepared = state
        .account_abstraction()?
        .builder
        .prepare_transfer(request)
        .await?;

    Ok(Json(json!({
        "success": true,
        "userOperation": prepared.operation(),
        "stage": prepared.stage(),
        "transfer": {
            "from": sender,
            "to": to,
            "amount": amount,
            "token": USDC_ADDRESS,
        },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    user_operation: Option<UserOperation>,
}

async fn submit_operation(
    state: &AppState,
    operation: Option<UserOperation>,
) -> ApiResult<Json<SubmissionReport>> {
    let operation = operation.ok_or_else(|| {
        FacilitatorError::BadRequest("Signed userOperation is required".to_string())
    })?;
    let report = state
        .account_abstraction()?
        .submitter
        .submit(operation)
        .await?;

    Ok(Json(report))
}

async fn submit(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<SubmissionReport>> {
    let body: SubmitBody = parse_body(&body)?;
    submit_operation(&state, body.user_operation).await
}

async fn bundler_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    if state.account_abstraction.is_some() {
        Json(json!({ "configured": true, "network": SUPPORTED_NETWORK }))
    } else {
        Json(json!({
            "configured": false,
            "network": SUPPORTED_NETWORK,
            "message": "Bundler API key not configured",
        }))
    }
}

async fn network_submit(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<SubmissionReport>> {
    let body: SubmitBody = parse_body(&body)?;
    if body.network.as_deref() != Some(SUPPORTED_NETWORK) {
        return Err(FacilitatorError::BadRequest(
            "Unsupported network. Only base-sepolia is supported.".to_string(),
        ));
    }
    submit_operation(&state, body.user_operation).await
}

// Paid plays

async fn gacha_requirements(State(state): State<Arc<AppState>>) -> Response {
    let payment_info = state.negotiator.payment_info().await;
    let header = serde_json::to_string(&payment_info).unwrap_or_default();

    (
        StatusCode::PAYMENT_REQUIRED,
        [
            ("X-Payment-Required", "true".to_string()),
            ("X-Payment-Info", header),
        ],
        Json(json!({
            "error": "Payment Required",
            "paymentInfo": payment_info,
        })),
    )
        .into_response()
}

async fn gacha_play(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    // 1. Credential, then required fields including the token
    state.relayer.ensure_configured()?;
    let request: RelayRequest = parse_body(&body)?;
    let signed = request.require_fields()?;
    let Some(symbol) = signed.token.as_deref() else {
        return Err(FacilitatorError::BadRequest("Missing required fields".to_string()));
    };

    // 2. Recipient, token, amount
    if signed.authorization.to != state.negotiator.recipient() {
        return Err(FacilitatorError::WrongRecipient);
    }
    let token: TokenSymbol = symbol.parse()?;
    state
        .negotiator
        .validate(token, signed.authorization.to, signed.authorization.value)
        .await?;

    // 3. Relay and wait for the transfer
    let receipt = state.relayer.relay(token, &signed).await?;
    if receipt.status != TxStatus::Confirmed {
        return Err(FacilitatorError::PaymentFailed(receipt.transaction_hash));
    }

    let fortune = state.content.fetch().await;
    info!(token = %token, tx_hash = ?receipt.transaction_hash, "Paid play delivered");

    Ok(Json(json!({
        "success": true,
        "transactionHash": receipt.transaction_hash,
        "fortune": fortune,
        "paidWith": token,
        "paidAmount": signed.authorization.value.to_string(),
    })))
}

async fn passkey_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let amount = state.negotiator.minimum_amount(TokenSymbol::Usdc).await;
    Json(json!({
        "recipient": state.negotiator.recipient(),
        "amount": amount.to_string(),
        "configured": state.account_abstraction.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasskeyBody {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    user_op: Option<Value>,
}

async fn passkey_play(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Response> {
    let aa = state.account_abstraction()?;
    let body: PasskeyBody = parse_body(&body)?;

    match body.action.as_deref() {
        Some("prepare") => {
            let request: CallRequest = match body.user_op {
                Some(user_op) => parse_value(user_op)?,
                None => return Err(FacilitatorError::BadRequest("Missing userOp fields".to_string())),
            };
            let prepared = aa.builder.prepare_call(request).await?;

            Ok(Json(json!({
                "success": true,
                "preparedUserOp": prepared.operation(),
                "stage": prepared.stage(),
            }))
            .into_response())
        }
        Some("submit") => {
            let operation: UserOperation = match body.user_op {
                Some(user_op) => parse_value(user_op)?,
                None => return Err(FacilitatorError::BadRequest("Missing signed userOp".to_string())),
            };
            let report = aa.submitter.submit(operation).await?;

            match report.status {
                TxStatus::Confirmed => {
                    let fortune = state.content.fetch().await;
                    Ok(Json(json!({
                        "success": true,
                        "userOpHash": report.user_op_hash,
                        "transactionHash": report.transaction_hash,
                        "fortune": fortune,
                    }))
                    .into_response())
                }
                TxStatus::Pending => Ok((
                    StatusCode::ACCEPTED,
                    Json(json!({
                        "success": true,
                        "userOpHash": report.user_op_hash,
                        "status": TxStatus::Pending,
                    })),
                )
                    .into_response()),
                TxStatus::Failed => Err(FacilitatorError::PaymentFailed(
                    report.transaction_hash.unwrap_or(report.user_op_hash),
                )),
            }
        }
        _ => Err(FacilitatorError::BadRequest("Invalid action".to_string())),
    }
}
