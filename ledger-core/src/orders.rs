use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{LedgerError, LedgerResult};
use crate::types::{round_banker, OrderId, OrderStatus, Product, Side, UserId, PRICE_DP};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub symbol: String,
    pub quantity: i64,
    pub price: Option<Decimal>,
    pub side: Side,
    pub product: Product,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_fill_price: Decimal,
    pub broker_order_id: Option<String>,
}

impl Order {
    pub fn remaining_qty(&self) -> i64 {
        self.quantity - self.filled_qty
    }

    /// Terminal states are absorbing; this enforces it for every transition
    /// the order lifecycle controller or fill service attempts.
    pub fn transition_to(&mut self, next: OrderStatus) -> LedgerResult<()> {
        if self.status.is_terminal() {
            return Err(LedgerError::InvariantViolation(format!(
                "order {} already terminal ({}), cannot move to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderFill {
    pub id: Option<i64>,
    pub order_id: OrderId,
    pub broker_fill_id: Option<String>,
    pub quantity: i64,
    pub price: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Recomputes `avg_fill_price` as the weighted mean of all fills applied so
/// far, including the one just recorded.
pub fn recompute_avg_fill_price(prior_qty: i64, prior_avg: Decimal, new_qty: i64, new_price: Decimal) -> Decimal {
    if prior_qty + new_qty == 0 {
        return Decimal::ZERO;
    }
    let total_value = Decimal::from(prior_qty) * prior_avg + Decimal::from(new_qty) * new_price;
    round_banker(total_value / Decimal::from(prior_qty + new_qty), PRICE_DP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn avg_fill_price_is_weighted_mean_of_fills() {
        let after_first = recompute_avg_fill_price(0, dec!(0), 40, dec!(49));
        assert_eq!(after_first, dec!(49.0000));
        let after_second = recompute_avg_fill_price(40, after_first, 60, dec!(48));
        assert_eq!(after_second, dec!(48.4000));
    }

    #[test]
    fn terminal_transitions_are_rejected() {
        let mut order = Order {
            id: 1,
            user_id: 1,
            symbol: "ABC".into(),
            quantity: 10,
            price: None,
            side: Side::Buy,
            product: Product::Equity,
            status: OrderStatus::Filled,
            filled_qty: 10,
            avg_fill_price: dec!(10),
            broker_order_id: Some("B1".into()),
        };
        assert!(order.transition_to(OrderStatus::Cancelled).is_err());
    }
}
