//! Order placement workflow: reservation + broker call + audit + publish.
//! The broker call happens outside the enclosing transaction (it's a
//! network suspension point); the reservation and its audit row always
//! share one transaction with the order insert.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde_json::json;

use crate::audit::AuditAction;
use crate::broker::{retry_with_backoff, BrokerAdapter, PlaceOrderRequest};
use crate::error::{LedgerError, LedgerResult};
use crate::events::{EventBus, TOPIC_ORDER_CANCEL_TRADER, TOPIC_ORDER_NEW};
use crate::holdings::{reserve_funds, reserve_holdings, validate_sell, Holding};
use crate::orders::Order;
use crate::store::LedgerStore;
use crate::types::{OrderId, OrderStatus, Product, Side, UserId};

pub struct PlaceOrderRequestArgs {
    pub symbol: String,
    pub quantity: i64,
    pub side: Side,
    pub product: Product,
    pub limit_price: Option<Decimal>,
}

pub struct OrderLifecycleController<'a, S: LedgerStore, B: BrokerAdapter> {
    pub store: &'a S,
    pub events: &'a EventBus,
    pub broker: &'a B,
    pub debug_mode: bool,
}

impl<'a, S: LedgerStore, B: BrokerAdapter> OrderLifecycleController<'a, S, B> {
    pub fn new(store: &'a S, events: &'a EventBus, broker: &'a B, debug_mode: bool) -> Self {
        Self { store, events, broker, debug_mode }
    }

    pub async fn place_order(
        &self,
        trader_id: UserId,
        client_id: UserId,
        req: PlaceOrderRequestArgs,
    ) -> LedgerResult<Order> {
        if req.quantity <= 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        if !self.debug_mode && !self.store.trader_maps_to_client(trader_id, client_id).await? {
            return Err(LedgerError::NotAuthorized);
        }

        let est_cost = match (req.side, req.limit_price) {
            (Side::Buy, Some(price)) => {
                let cost = price * Decimal::from(req.quantity);
                let mut tx = self.store.begin().await?;
                let account = self.store.lock_account(&mut tx, client_id).await?;
                self.store.rollback(tx).await?;
                if account.cash_available < cost {
                    return Err(LedgerError::InsufficientFunds {
                        have: account.cash_available,
                        want: cost,
                    });
                }
                Some(cost)
            }
            (Side::Sell, _) => {
                let mut tx = self.store.begin().await?;
                let holding = self.store.lock_holding(&mut tx, client_id, &req.symbol).await?;
                self.store.rollback(tx).await?;
                validate_sell(holding.as_ref(), &req.symbol, req.quantity)?;
                None
            }
            _ => None,
        };

        let session = self.broker.ensure_session(client_id).await;
        if !session.ok {
            return Err(LedgerError::SessionError(
                session.reason.unwrap_or_else(|| "session not ready".into()),
            ));
        }

        let broker_req = PlaceOrderRequest {
            symbol: req.symbol.clone(),
            quantity: req.quantity,
            side: req.side,
            product: req.product,
            limit_price: req.limit_price,
        };
        let placed = retry_with_backoff(|| self.broker.place_order(broker_req.clone()))
            .await
            .map_err(LedgerError::from)?;

        let mut tx = self.store.begin().await?;
        let result = self
            .persist_accepted_order(&mut tx, client_id, &req, est_cost, &placed.broker_order_id)
            .await;
        let (order, account) = match result {
            Ok(pair) => {
                self.store.commit(tx).await?;
                pair
            }
            Err(err) => {
                self.store.rollback(tx).await?;
                return Err(err);
            }
        };

        self.events.publish(
            TOPIC_ORDER_NEW,
            json!({
                "order_id": order.id,
                "user_id": order.user_id,
                "symbol": order.symbol,
                "qty": order.quantity,
                "status": order.status.to_string(),
                "cash_available": account.cash_available.to_string(),
                "cash_blocked": account.cash_blocked.to_string(),
            }),
        );

        Ok(order)
    }

    async fn persist_accepted_order(
        &self,
        tx: &mut S::Tx,
        client_id: UserId,
        req: &PlaceOrderRequestArgs,
        est_cost: Option<Decimal>,
        broker_order_id: &str,
    ) -> LedgerResult<(Order, crate::holdings::Account)> {
        let order = Order {
            id: 0,
            user_id: client_id,
            symbol: req.symbol.clone(),
            quantity: req.quantity,
            price: req.limit_price,
            side: req.side,
            product: req.product,
            status: OrderStatus::Accepted,
            filled_qty: 0,
            avg_fill_price: Decimal::ZERO,
            broker_order_id: Some(broker_order_id.to_string()),
        };
        let order_id = self.store.insert_order(tx, &order).await?;
        let mut order = order;
        order.id = order_id;

        self.store
            .append_audit(
                tx,
                Some(client_id),
                client_id,
                AuditAction::OrderAccepted,
                &format!("Order {order_id} accepted by broker as {broker_order_id}"),
                BTreeMap::from([
                    ("order_id".into(), json!(order_id)),
                    ("broker_order_id".into(), json!(broker_order_id)),
                ]),
            )
            .await?;

        let mut account = self.store.lock_account(tx, client_id).await?;

        match req.side {
            Side::Buy => {
                if let Some(cost) = est_cost {
                    reserve_funds(&mut account, cost)?;
                    self.store.save_account(tx, &account).await?;
                    self.store
                        .append_audit(
                            tx,
                            Some(client_id),
                            client_id,
                            AuditAction::FundsDebit,
                            &format!("Reserved {cost} for order {order_id}"),
                            BTreeMap::from([
                                ("order_id".into(), json!(order_id)),
                                ("amount".into(), json!(cost.to_string())),
                            ]),
                        )
                        .await?;
                }
                // MARKET buys without a limit_price reserve no funds at
                // placement: a documented limitation (see design notes).
            }
            Side::Sell => {
                let mut holding = self
                    .store
                    .lock_holding(tx, client_id, &req.symbol)
                    .await?
                    .unwrap_or_else(|| Holding::empty(client_id, req.symbol.clone()));
                reserve_holdings(&mut holding, req.quantity)?;
                self.store.save_holding(tx, &holding).await?;
                self.store
                    .append_audit(
                        tx,
                        Some(client_id),
                        client_id,
                        AuditAction::HoldingsReserved,
                        &format!("Reserved {} {} for order {order_id}", req.quantity, req.symbol),
                        BTreeMap::from([
                            ("order_id".into(), json!(order_id)),
                            ("symbol".into(), json!(req.symbol)),
                            ("qty".into(), json!(req.quantity)),
                        ]),
                    )
                    .await?;
            }
        }

        Ok((order, account))
    }

    /// Trader-initiated cancel. Idempotent: a terminal order's status is
    /// returned unchanged.
    pub async fn cancel_order(&self, order_id: OrderId) -> LedgerResult<(Order, bool)> {
        let fills = crate::fills::FillService::new(self.store, self.events);
        let (order, idempotent) = fills.apply_cancel(order_id, OrderStatus::Cancelled).await?;
        if !idempotent {
            self.events.publish(
                TOPIC_ORDER_CANCEL_TRADER,
                json!({"order_id": order.id, "user_id": order.user_id, "status": order.status.to_string()}),
            );
        }
        Ok((order, idempotent))
    }
}
