//! One concrete `BrokerAdapter` per vendor, selected by a table from
//! `user.broker` to a factory (design note in the core crate). Every vendor
//! speaks a single normalized JSON convention here; what differs between
//! them is the base URL and which status codes they document for session
//! failure. The adapter never writes to the ledger and never retries itself
//! — `ledger_core::broker::retry_with_backoff` owns that at the controller.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ledger_core::broker::{BrokerAdapter, BrokerError, PlaceOrderRequest, PlaceOrderResult, SessionStatus};
use ledger_core::types::{OrderStatus, Side, UserId};
use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Vendor {
    Zerodha,
    Groww,
    Upstox,
    Icici,
}

impl Vendor {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "zerodha" => Some(Vendor::Zerodha),
            "groww" => Some(Vendor::Groww),
            "upstox" => Some(Vendor::Upstox),
            "icici" => Some(Vendor::Icici),
            _ => None,
        }
    }

    fn base_url(self) -> &'static str {
        match self {
            Vendor::Zerodha => "https://api.kite.trade",
            Vendor::Groww => "https://api.groww.in",
            Vendor::Upstox => "https://api.upstox.com/v2",
            Vendor::Icici => "https://api.icicidirect.com",
        }
    }

    /// ICICI's documented integration additionally treats 403 as a session
    /// failure (expired token, not just an absent one); the others only
    /// document 401 for that case.
    fn classifies_403_as_session(self) -> bool {
        matches!(self, Vendor::Icici)
    }
}

/// `user_id -> session token`. Populated by whatever external auth flow
/// issues broker credentials; out of scope here beyond this lookup table
/// (see the core crate's non-goals around JWT/OTP issuance).
pub type SessionRegistry = Arc<DashMap<UserId, String>>;

pub struct HttpBrokerAdapter {
    vendor: Vendor,
    client: reqwest::Client,
    sessions: SessionRegistry,
    user_id: UserId,
}

impl HttpBrokerAdapter {
    /// Bound to a single client at construction: the registry hands out one
    /// adapter per (vendor, user) pair rather than threading `user_id`
    /// through every trait method, since `BrokerAdapter::place_order` only
    /// takes the order request (see the core crate).
    pub fn new(vendor: Vendor, user_id: UserId, sessions: SessionRegistry) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client configuration is valid");
        Self { vendor, client, sessions, user_id }
    }

    fn token(&self) -> Option<String> {
        self.sessions.get(&self.user_id).map(|entry| entry.value().clone())
    }

    fn classify_status(&self, status: reqwest::StatusCode, context: &str) -> BrokerError {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return BrokerError::Session(format!("{context}: session invalid"));
        }
        if status == reqwest::StatusCode::FORBIDDEN && self.vendor.classifies_403_as_session() {
            return BrokerError::Session(format!("{context}: access forbidden"));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return BrokerError::RateLimit;
        }
        if status.is_server_error() {
            return BrokerError::Temporary(format!("{context}: vendor status {status}"));
        }
        BrokerError::Permanent(format!("{context}: vendor status {status}"))
    }

    /// Network timeouts, connect failures and DNS errors are all transient
    /// from the caller's perspective, matching the `TemporaryError` trigger
    /// list in the error taxonomy.
    fn classify_transport_error(&self, err: reqwest::Error, context: &str) -> BrokerError {
        BrokerError::Temporary(format!("{context}: {err}"))
    }
}

impl BrokerAdapter for HttpBrokerAdapter {
    async fn ensure_session(&self, _user_id: i64) -> SessionStatus {
        match self.token() {
            Some(_) => SessionStatus { ok: true, refreshed: false, reason: None },
            None => SessionStatus { ok: false, refreshed: false, reason: Some("no_session".into()) },
        }
    }

    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResult, BrokerError> {
        let token = self.token().ok_or_else(|| BrokerError::Session("no_session".into()))?;

        let order_type = if req.limit_price.is_some() { "LIMIT" } else { "MARKET" };
        let payload = json!({
            "symbol": req.symbol,
            "side": if matches!(req.side, Side::Buy) { "BUY" } else { "SELL" },
            "quantity": req.quantity,
            "order_type": order_type,
            "product": if matches!(req.product, ledger_core::types::Product::Mtf) { "MTF" } else { "DELIVERY" },
            "price": req.limit_price,
        });

        let resp = self
            .client
            .post(format!("{}/orders", self.vendor.base_url()))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(e, "place_order"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(self.classify_status(status, "place_order"));
        }
        let raw: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Temporary(format!("place_order: malformed response body: {e}")))?;
        let broker_order_id = raw
            .get("order_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::Permanent("place_order: response missing order_id".into()))?
            .to_string();

        Ok(PlaceOrderResult {
            status: OrderStatus::Accepted,
            broker_order_id,
            placed_qty: req.quantity,
            filled_qty: 0,
            avg_fill_price: None,
            raw,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<serde_json::Value, BrokerError> {
        let token = self.token().ok_or_else(|| BrokerError::Session("no_session".into()))?;
        let resp = self
            .client
            .delete(format!("{}/orders/{}", self.vendor.base_url(), broker_order_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(e, "cancel_order"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.classify_status(status, "cancel_order"));
        }
        resp.json()
            .await
            .map_err(|e| BrokerError::Temporary(format!("cancel_order: malformed response body: {e}")))
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<serde_json::Value, BrokerError> {
        let token = self.token().ok_or_else(|| BrokerError::Session("no_session".into()))?;
        let resp = self
            .client
            .get(format!("{}/orders/{}", self.vendor.base_url(), broker_order_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(e, "get_order_status"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.classify_status(status, "get_order_status"));
        }
        resp.json()
            .await
            .map_err(|e| BrokerError::Temporary(format!("get_order_status: malformed response body: {e}")))
    }
}

/// Vendor selection table: `user.broker -> adapter`, per the core's
/// "runtime dispatch over broker vendors" design note.
pub struct BrokerRegistry {
    sessions: SessionRegistry,
}

impl BrokerRegistry {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self { sessions }
    }

    pub fn adapter_for(&self, broker_name: &str, user_id: UserId) -> Option<HttpBrokerAdapter> {
        Vendor::from_str(broker_name).map(|vendor| HttpBrokerAdapter::new(vendor, user_id, self.sessions.clone()))
    }
}
