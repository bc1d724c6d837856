//! Read-side realized-PnL computation and the daily portfolio rollup.
//! Modeled as a restartable finite sequence over a user's fills ordered by
//! (created_at, id): callers can resume from any cursor rather than holding
//! a long-lived generator.

use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::orders::{Order, OrderFill};
use crate::types::{Side, UserId};

#[derive(Clone, Debug, Default)]
struct Lot {
    qty: i64,
    price: Decimal,
}

/// Walks all fills of executed orders for a user, maintaining a per-symbol
/// FIFO queue of open buy lots. Each sell fill dequeues lots to match the
/// sold quantity; if the queue empties mid-match the excess is zero-basis
/// (no shorting support, matches the documented limitation).
pub fn compute_realized_pnl(fills: &[(Order, OrderFill)]) -> Decimal {
    let mut lots: HashMap<String, VecDeque<Lot>> = HashMap::new();
    let mut realized = Decimal::ZERO;

    let mut ordered: Vec<&(Order, OrderFill)> = fills.iter().collect();
    ordered.sort_by_key(|(_, fill)| (fill.created_at, fill.id.unwrap_or(0)));

    for (order, fill) in ordered {
        let queue = lots.entry(order.symbol.clone()).or_default();
        match order.side {
            Side::Buy => queue.push_back(Lot { qty: fill.quantity, price: fill.price }),
            Side::Sell => {
                let mut remaining = fill.quantity;
                while remaining > 0 {
                    let Some(front) = queue.front_mut() else {
                        // No basis left: treat the excess as zero-cost.
                        break;
                    };
                    let matched = remaining.min(front.qty);
                    realized += (fill.price - front.price) * Decimal::from(matched);
                    front.qty -= matched;
                    remaining -= matched;
                    if front.qty == 0 {
                        queue.pop_front();
                    }
                }
            }
        }
    }
    realized
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoldingView {
    pub symbol: String,
    pub qty: i64,
    pub avg_price: Decimal,
    pub mkt_price: Decimal,
    pub unrealized: Decimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339::option")]
    pub snapshot_date: Option<time::OffsetDateTime>,
    pub cash_available: Decimal,
    pub cash_blocked: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub holdings: Vec<HoldingView>,
}

/// `mark_price` supplies the current market price for a symbol; the core
/// does not discover prices itself (out of scope per the market-data
/// non-goal).
pub fn build_snapshot(
    user_id: UserId,
    cash_available: Decimal,
    cash_blocked: Decimal,
    realized_pnl: Decimal,
    holdings: &[crate::holdings::Holding],
    mark_price: impl Fn(&str) -> Option<Decimal>,
) -> PortfolioSnapshot {
    let mut unrealized_total = Decimal::ZERO;
    let views: Vec<HoldingView> = holdings
        .iter()
        .map(|h| {
            let mkt = mark_price(&h.symbol).unwrap_or(h.avg_price);
            let unrealized = (mkt - h.avg_price) * Decimal::from(h.quantity);
            unrealized_total += unrealized;
            HoldingView {
                symbol: h.symbol.clone(),
                qty: h.quantity,
                avg_price: h.avg_price,
                mkt_price: mkt,
                unrealized,
            }
        })
        .collect();

    PortfolioSnapshot {
        user_id,
        snapshot_date: None,
        cash_available,
        cash_blocked,
        realized_pnl,
        unrealized_pnl: unrealized_total,
        holdings: views,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStatus, Product};
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn order(id: i64, side: Side, symbol: &str) -> Order {
        Order {
            id,
            user_id: 1,
            symbol: symbol.into(),
            quantity: 100,
            price: None,
            side,
            product: Product::Equity,
            status: OrderStatus::Filled,
            filled_qty: 0,
            avg_fill_price: Decimal::ZERO,
            broker_order_id: Some("B".into()),
        }
    }

    fn fill(order_id: i64, id: i64, qty: i64, price: Decimal, ts: i64) -> OrderFill {
        OrderFill {
            id: Some(id),
            order_id,
            broker_fill_id: None,
            quantity: qty,
            price,
            created_at: OffsetDateTime::from_unix_timestamp(ts).unwrap(),
        }
    }

    #[test]
    fn fifo_matches_sells_against_earliest_buy_lots() {
        let buy1 = order(1, Side::Buy, "ABC");
        let buy2 = order(2, Side::Buy, "ABC");
        let sell = order(3, Side::Sell, "ABC");

        let fills = vec![
            (buy1, fill(1, 1, 50, dec!(100), 1)),
            (buy2, fill(2, 2, 50, dec!(120), 2)),
            (sell, fill(3, 3, 60, dec!(130), 3)),
        ];

        // First 50 matched at cost 100 (+30*50=1500), remaining 10 matched at 120 (+10*10=100)
        let realized = compute_realized_pnl(&fills);
        assert_eq!(realized, dec!(1600));
    }

    #[test]
    fn sell_exceeding_lots_is_zero_basis_for_the_excess() {
        let buy = order(1, Side::Buy, "ABC");
        let sell = order(2, Side::Sell, "ABC");
        let fills = vec![
            (buy, fill(1, 1, 10, dec!(100), 1)),
            (sell, fill(2, 2, 25, dec!(110), 2)),
        ];
        // Only 10 units have basis: (110-100)*10 = 100. Remaining 15 contribute 0.
        assert_eq!(compute_realized_pnl(&fills), dec!(100));
    }
}
