//! Uniform broker adapter interface. One concrete implementation per vendor,
//! selected by a table from `user.broker` to a factory (see `store`'s
//! `BrokerRegistry`). The adapter never writes to the ledger; it only talks
//! to the vendor and normalizes whatever comes back into `BrokerError`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{OrderStatus, Product, Side};

#[derive(Debug)]
pub enum BrokerError {
    Session(String),
    RateLimit,
    Temporary(String),
    Permanent(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Session(r) => write!(f, "session error: {r}"),
            BrokerError::RateLimit => write!(f, "rate limited"),
            BrokerError::Temporary(r) => write!(f, "temporary error: {r}"),
            BrokerError::Permanent(r) => write!(f, "permanent error: {r}"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<BrokerError> for crate::error::LedgerError {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::Session(r) => crate::error::LedgerError::SessionError(r),
            BrokerError::RateLimit => crate::error::LedgerError::RateLimit,
            BrokerError::Temporary(r) => crate::error::LedgerError::TemporaryError(r),
            BrokerError::Permanent(r) => crate::error::LedgerError::PermanentError(r),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub ok: bool,
    pub refreshed: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub quantity: i64,
    pub side: Side,
    pub product: Product,
    pub limit_price: Option<Decimal>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaceOrderResult {
    pub status: OrderStatus,
    pub broker_order_id: String,
    pub placed_qty: i64,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Decimal>,
    pub raw: Value,
}

/// Per-vendor session/order interface. Methods return `impl Future` rather
/// than requiring `#[async_trait]`: Rust 1.75 allows `async fn` directly in
/// traits, which is sufficient here because nothing needs a boxed,
/// object-safe trait object — the registry dispatches on a concrete enum.
pub trait BrokerAdapter: Send + Sync {
    fn ensure_session(&self, user_id: i64) -> impl Future<Output = SessionStatus> + Send;

    fn place_order(
        &self,
        req: PlaceOrderRequest,
    ) -> impl Future<Output = Result<PlaceOrderResult, BrokerError>> + Send;

    fn cancel_order(
        &self,
        broker_order_id: &str,
    ) -> impl Future<Output = Result<Value, BrokerError>> + Send;

    fn get_order_status(
        &self,
        broker_order_id: &str,
    ) -> impl Future<Output = Result<Value, BrokerError>> + Send;
}

/// Three total attempts, independent jittered sleep (300-600ms) per attempt,
/// no state mutation on intermediate failure. Only `BrokerError::Temporary`
/// is retried; session/rate-limit/permanent errors surface immediately.
pub async fn retry_with_backoff<F, Fut, T>(mut attempt: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for attempt_no in 0..MAX_ATTEMPTS {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(BrokerError::Temporary(reason)) => {
                tracing::warn!(attempt = attempt_no + 1, %reason, "broker call failed, retrying");
                last_err = Some(BrokerError::Temporary(reason));
                if attempt_no + 1 < MAX_ATTEMPTS {
                    let jitter_ms = rand::thread_rng().gen_range(300..=600);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or(BrokerError::Temporary("exhausted retries".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_temporary_errors_up_to_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), BrokerError> = retry_with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Temporary("boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), BrokerError> = retry_with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Permanent("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BrokerError::Temporary("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
