//! Signed broker callbacks: `/broker/fill` and `/broker/cancel`. Signature
//! verification runs against the raw request body — never a re-serialized
//! parse — before anything is deserialized.

use actix_web::{post, web, HttpRequest, HttpResponse, ResponseError};
use ledger_core::error::{ErrorClass, LedgerError};
use ledger_core::fills::FillService;
use ledger_core::types::{OrderId, OrderStatus};
use ledger_core::webhook::{verify_signature, VerifyError, ALGO_HEADER, SIGNATURE_HEADER};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::store_pg::PgStore;

#[derive(Debug)]
pub enum WebhookError {
    /// Opaque on purpose: verification failures never distinguish "missing"
    /// from "wrong" from "unsupported algorithm" to the caller, avoiding an
    /// oracle for forging signatures.
    InvalidSignature,
    Ledger(LedgerError),
    MalformedBody(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::InvalidSignature => write!(f, "invalid signature"),
            WebhookError::Ledger(e) => write!(f, "{e}"),
            WebhookError::MalformedBody(e) => write!(f, "malformed request body: {e}"),
        }
    }
}

impl ResponseError for WebhookError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            WebhookError::Ledger(e) => match e.class() {
                ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
                ErrorClass::Unauthorized => StatusCode::UNAUTHORIZED,
                ErrorClass::Forbidden => StatusCode::FORBIDDEN,
                ErrorClass::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ErrorClass::BadGateway => StatusCode::BAD_GATEWAY,
                ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                ErrorClass::Ok => StatusCode::OK,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({"error": self.to_string()}))
    }
}

fn require_signature(req: &HttpRequest, body: &[u8], state: &AppState) -> Result<(), WebhookError> {
    let signature = req.headers().get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let algo = req.headers().get(ALGO_HEADER).and_then(|v| v.to_str().ok());
    verify_signature(body, signature, algo, &state.settings.webhook_secrets)
        .map_err(|_: VerifyError| WebhookError::InvalidSignature)
}

#[derive(Debug, Deserialize)]
struct FillPayload {
    order_id: OrderId,
    quantity: i64,
    price: rust_decimal::Decimal,
    broker_fill_id: Option<String>,
}

#[post("/broker/fill")]
pub async fn broker_fill(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    require_signature(&req, &body, &state)?;
    let payload: FillPayload =
        serde_json::from_slice(&body).map_err(|e| WebhookError::MalformedBody(e.to_string()))?;

    tracing::info!(order_id = payload.order_id, quantity = payload.quantity, "received fill webhook");

    let service = FillService::<PgStore>::new(&state.store, &state.events);
    match service
        .apply_fill(payload.order_id, payload.quantity, payload.price, payload.broker_fill_id)
        .await
    {
        Ok(outcome) => {
            tracing::info!(
                order_id = payload.order_id,
                user_id = outcome.order.user_id,
                status = %outcome.order.status,
                "fill applied"
            );
            Ok(HttpResponse::Ok().json(json!({
                "status": outcome.order.status.to_string(),
                "filled_qty": outcome.order.filled_qty,
                "cash_available": outcome.cash_available.to_string(),
                "cash_blocked": outcome.cash_blocked.to_string(),
            })))
        }
        Err(LedgerError::FillAlreadyApplied) => {
            tracing::info!(order_id = payload.order_id, "ignoring duplicate fill");
            Ok(HttpResponse::Ok().json(json!({"status": "IGNORED", "reason": "duplicate"})))
        }
        Err(e @ LedgerError::InvariantViolation(_)) => {
            tracing::error!(order_id = payload.order_id, error = %e, "invariant violation applying fill");
            Err(WebhookError::Ledger(e))
        }
        Err(e) => Err(WebhookError::Ledger(e)),
    }
}

#[derive(Debug, Deserialize)]
struct CancelPayload {
    order_id: OrderId,
    status: OrderStatus,
}

#[post("/broker/cancel")]
pub async fn broker_cancel(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    require_signature(&req, &body, &state)?;
    let payload: CancelPayload =
        serde_json::from_slice(&body).map_err(|e| WebhookError::MalformedBody(e.to_string()))?;

    tracing::info!(order_id = payload.order_id, status = %payload.status, "received cancel webhook");

    let service = FillService::<PgStore>::new(&state.store, &state.events);
    let (order, idempotent) = service.apply_cancel(payload.order_id, payload.status).await.map_err(|e| {
        if let LedgerError::InvariantViolation(_) = &e {
            tracing::error!(order_id = payload.order_id, error = %e, "invariant violation applying cancel");
        }
        WebhookError::Ledger(e)
    })?;

    tracing::info!(order_id = payload.order_id, user_id = order.user_id, idempotent, "cancel applied");

    Ok(HttpResponse::Ok().json(json!({
        "status": order.status.to_string(),
        "idempotent": idempotent,
    })))
}
