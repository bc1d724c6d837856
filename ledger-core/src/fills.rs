//! Applies partial/full fills and cancels. Both entry points run inside a
//! single transaction with row-level locks on the order, the relevant
//! holding, and the user's cash fields, acquired via the `LedgerStore`.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde_json::json;
use time::OffsetDateTime;

use crate::audit::AuditAction;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{EventBus, TOPIC_ORDER_CANCEL, TOPIC_ORDER_FILL};
use crate::holdings::{apply_buy, apply_sell, release_funds, release_holdings, Holding};
use crate::orders::{recompute_avg_fill_price, Order, OrderFill};
use crate::store::LedgerStore;
use crate::types::{OrderId, OrderStatus, Side};

pub struct FillOutcome {
    pub order: Order,
    pub cash_available: Decimal,
    pub cash_blocked: Decimal,
}

pub struct FillService<'a, S: LedgerStore> {
    pub store: &'a S,
    pub events: &'a EventBus,
}

impl<'a, S: LedgerStore> FillService<'a, S> {
    pub fn new(store: &'a S, events: &'a EventBus) -> Self {
        Self { store, events }
    }

    pub async fn apply_fill(
        &self,
        order_id: OrderId,
        qty: i64,
        price: Decimal,
        broker_fill_id: Option<String>,
    ) -> LedgerResult<FillOutcome> {
        if price <= Decimal::ZERO {
            return Err(LedgerError::InvalidPrice);
        }
        if qty <= 0 {
            return Err(LedgerError::InvalidQuantity);
        }

        let mut tx = self.store.begin().await?;
        let result = self.apply_fill_in_tx(&mut tx, order_id, qty, price, broker_fill_id.as_deref()).await;
        match result {
            Ok(outcome) => {
                self.store.commit(tx).await?;
                self.publish_fill(&outcome);
                Ok(outcome)
            }
            Err(LedgerError::FillAlreadyApplied) => {
                self.store.rollback(tx).await?;
                Err(LedgerError::FillAlreadyApplied)
            }
            Err(err) => {
                self.store.rollback(tx).await?;
                Err(err)
            }
        }
    }

    async fn apply_fill_in_tx(
        &self,
        tx: &mut S::Tx,
        order_id: OrderId,
        qty: i64,
        price: Decimal,
        broker_fill_id: Option<&str>,
    ) -> LedgerResult<FillOutcome> {
        let mut order = self.store.lock_order(tx, order_id).await?;
        if order.status.is_terminal() {
            return Err(LedgerError::FillOnTerminal);
        }

        if let Some(key) = broker_fill_id {
            if self.store.fill_exists(tx, order_id, key).await? {
                return Err(LedgerError::FillAlreadyApplied);
            }
        }

        let remaining = order.remaining_qty();
        let apply_qty = qty.min(remaining);
        if apply_qty <= 0 {
            let account = self.store.lock_account(tx, order.user_id).await?;
            return Ok(FillOutcome {
                order,
                cash_available: account.cash_available,
                cash_blocked: account.cash_blocked,
            });
        }

        let fill = OrderFill {
            id: None,
            order_id: order.id,
            broker_fill_id: broker_fill_id.map(str::to_string),
            quantity: apply_qty,
            price,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_fill(tx, &fill).await?;

        order.avg_fill_price =
            recompute_avg_fill_price(order.filled_qty, order.avg_fill_price, apply_qty, price);
        order.filled_qty += apply_qty;

        let mut account = self.store.lock_account(tx, order.user_id).await?;

        match order.side {
            Side::Buy => {
                let cost = Decimal::from(apply_qty) * price;
                account.cash_blocked = (account.cash_blocked - cost).max(Decimal::ZERO);
                let mut holding = self
                    .store
                    .lock_holding(tx, order.user_id, &order.symbol)
                    .await?
                    .unwrap_or_else(|| Holding::empty(order.user_id, order.symbol.clone()));
                apply_buy(&mut holding, apply_qty, price)?;
                self.store.save_holding(tx, &holding).await?;

                self.store
                    .append_audit(
                        tx,
                        None,
                        order.user_id,
                        AuditAction::FundsDebit,
                        &format!("Consumed blocked funds {cost} for buy fill on order {}", order.id),
                        BTreeMap::from([
                            ("order_id".into(), json!(order.id)),
                            ("qty".into(), json!(apply_qty)),
                            ("amount".into(), json!(cost.to_string())),
                        ]),
                    )
                    .await?;
            }
            Side::Sell => {
                let mut holding = self
                    .store
                    .lock_holding(tx, order.user_id, &order.symbol)
                    .await?
                    .ok_or(LedgerError::InvariantViolation(format!(
                        "sell fill on order {} with no holding row",
                        order.id
                    )))?;
                if holding.quantity < apply_qty {
                    return Err(LedgerError::InvariantViolation(format!(
                        "sell fill on order {} exceeds holding quantity",
                        order.id
                    )));
                }
                release_holdings(&mut holding, apply_qty);
                apply_sell(&mut holding, apply_qty)?;

                let proceeds = Decimal::from(apply_qty) * price;
                account.cash_available += proceeds;

                if holding.quantity == 0 {
                    self.store.delete_holding(tx, order.user_id, &order.symbol).await?;
                } else {
                    self.store.save_holding(tx, &holding).await?;
                }

                self.store
                    .append_audit(
                        tx,
                        None,
                        order.user_id,
                        AuditAction::FundsCredit,
                        &format!("Credited proceeds {proceeds} for sell fill on order {}", order.id),
                        BTreeMap::from([
                            ("order_id".into(), json!(order.id)),
                            ("qty".into(), json!(apply_qty)),
                            ("amount".into(), json!(proceeds.to_string())),
                        ]),
                    )
                    .await?;
            }
        }

        let filled_complete = order.filled_qty == order.quantity;
        if matches!(order.side, Side::Buy) && filled_complete && account.cash_blocked > Decimal::ZERO {
            let leftover = account.cash_blocked;
            release_funds(&mut account, leftover);
            self.store
                .append_audit(
                    tx,
                    None,
                    order.user_id,
                    AuditAction::FundsCredit,
                    &format!("Released leftover blocked {leftover} after full fill on order {}", order.id),
                    BTreeMap::from([
                        ("order_id".into(), json!(order.id)),
                        ("amount".into(), json!(leftover.to_string())),
                    ]),
                )
                .await?;
        }

        order.transition_to(if filled_complete {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        })?;

        self.store.save_account(tx, &account).await?;
        self.store.save_order(tx, &order).await?;

        self.store
            .append_audit(
                tx,
                None,
                order.user_id,
                AuditAction::FillApplied,
                &format!("Fill {apply_qty}@{price} on order {}", order.id),
                BTreeMap::from([
                    ("order_id".into(), json!(order.id)),
                    ("qty".into(), json!(apply_qty)),
                    ("price".into(), json!(price.to_string())),
                    ("filled_qty".into(), json!(order.filled_qty)),
                    ("status".into(), json!(order.status.to_string())),
                ]),
            )
            .await?;

        Ok(FillOutcome {
            order,
            cash_available: account.cash_available,
            cash_blocked: account.cash_blocked,
        })
    }

    fn publish_fill(&self, outcome: &FillOutcome) {
        self.events.publish(
            TOPIC_ORDER_FILL,
            json!({
                "order_id": outcome.order.id,
                "user_id": outcome.order.user_id,
                "symbol": outcome.order.symbol,
                "qty": outcome.order.filled_qty,
                "price": outcome.order.avg_fill_price.to_string(),
                "filled_qty": outcome.order.filled_qty,
                "status": outcome.order.status.to_string(),
                "cash_available": outcome.cash_available.to_string(),
                "cash_blocked": outcome.cash_blocked.to_string(),
            }),
        );
    }

    /// Idempotent: if the order is already terminal, returns it unchanged
    /// and appends no audit row.
    pub async fn apply_cancel(&self, order_id: OrderId, status: OrderStatus) -> LedgerResult<(Order, bool)> {
        if !matches!(status, OrderStatus::Cancelled | OrderStatus::Rejected) {
            return Err(LedgerError::InvalidQuantity);
        }

        let mut tx = self.store.begin().await?;
        let mut order = match self.store.lock_order(&mut tx, order_id).await {
            Ok(o) => o,
            Err(err) => {
                self.store.rollback(tx).await?;
                return Err(err);
            }
        };

        if order.status.is_terminal() {
            self.store.rollback(tx).await?;
            return Ok((order, true));
        }

        let result = self.apply_cancel_in_tx(&mut tx, &mut order, status).await;
        match result {
            Ok(account) => {
                self.store.commit(tx).await?;
                self.events.publish(
                    TOPIC_ORDER_CANCEL,
                    json!({
                        "order_id": order.id,
                        "user_id": order.user_id,
                        "status": order.status.to_string(),
                        "cash_available": account.0.to_string(),
                        "cash_blocked": account.1.to_string(),
                    }),
                );
                Ok((order, false))
            }
            Err(err) => {
                self.store.rollback(tx).await?;
                Err(err)
            }
        }
    }

    async fn apply_cancel_in_tx(
        &self,
        tx: &mut S::Tx,
        order: &mut Order,
        status: OrderStatus,
    ) -> LedgerResult<(Decimal, Decimal)> {
        let mut account = self.store.lock_account(tx, order.user_id).await?;
        let remaining = order.remaining_qty();

        match order.side {
            Side::Buy => {
                if remaining > 0 {
                    let blocked = account.cash_blocked;
                    release_funds(&mut account, blocked);
                }
            }
            Side::Sell => {
                if remaining > 0 {
                    if let Some(mut holding) =
                        self.store.lock_holding(tx, order.user_id, &order.symbol).await?
                    {
                        let release = remaining.min(holding.reserved_qty);
                        release_holdings(&mut holding, release);
                        self.store.save_holding(tx, &holding).await?;
                    }
                }
            }
        }

        order.transition_to(status)?;
        self.store.save_account(tx, &account).await?;
        self.store.save_order(tx, order).await?;

        let action = if status == OrderStatus::Cancelled {
            AuditAction::OrderCancelled
        } else {
            AuditAction::OrderRejected
        };
        self.store
            .append_audit(
                tx,
                None,
                order.user_id,
                action,
                &format!("Order {} {}", order.id, status),
                BTreeMap::from([
                    ("order_id".into(), json!(order.id)),
                    ("status".into(), json!(status.to_string())),
                ]),
            )
            .await?;

        Ok((account.cash_available, account.cash_blocked))
    }
}
