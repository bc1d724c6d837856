//! Pure functions over holdings and cash. Every operation here is expected to
//! run inside a transaction opened by the caller (see `store::LedgerStore`);
//! nothing in this module talks to a database.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::types::{round_banker, UserId, CASH_DP, PRICE_DP};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub cash_available: Decimal,
    pub cash_blocked: Decimal,
}

impl Account {
    pub fn new(user_id: UserId, cash_available: Decimal) -> Self {
        Self {
            user_id,
            cash_available: cash_available.round_dp(CASH_DP),
            cash_blocked: Decimal::ZERO,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Holding {
    pub user_id: UserId,
    pub symbol: String,
    pub quantity: i64,
    pub reserved_qty: i64,
    pub avg_price: Decimal,
}

impl Holding {
    pub fn empty(user_id: UserId, symbol: impl Into<String>) -> Self {
        Self {
            user_id,
            symbol: symbol.into(),
            quantity: 0,
            reserved_qty: 0,
            avg_price: Decimal::ZERO,
        }
    }

    pub fn free_qty(&self) -> i64 {
        self.quantity - self.reserved_qty
    }
}

/// `quantity ← quantity + qty`, `avg_price` recomputed as the qty-weighted mean,
/// rounded to 4dp with banker's rounding. Never touches cash.
pub fn apply_buy(holding: &mut Holding, qty: i64, price: Decimal) -> LedgerResult<()> {
    if price <= Decimal::ZERO {
        return Err(LedgerError::InvalidPrice);
    }
    if qty <= 0 {
        return Err(LedgerError::InvalidQuantity);
    }
    let old_qty = Decimal::from(holding.quantity);
    let new_qty = holding.quantity + qty;
    let weighted = old_qty * holding.avg_price + Decimal::from(qty) * price;
    holding.avg_price = round_banker(weighted / Decimal::from(new_qty), PRICE_DP);
    holding.quantity = new_qty;
    Ok(())
}

/// Fails with `InsufficientHoldings` when the holding is missing or short.
pub fn validate_sell(holding: Option<&Holding>, symbol: &str, qty: i64) -> LedgerResult<()> {
    let have = holding.map(|h| h.quantity).unwrap_or(0);
    if have < qty {
        return Err(LedgerError::InsufficientHoldings {
            symbol: symbol.to_string(),
            have,
            want: qty,
        });
    }
    Ok(())
}

/// Decrements `quantity`. Caller deletes the row when it reaches zero.
/// `avg_price` is preserved as the realized-PnL cost basis.
pub fn apply_sell(holding: &mut Holding, qty: i64) -> LedgerResult<()> {
    validate_sell(Some(holding), &holding.symbol, qty)?;
    holding.quantity -= qty;
    Ok(())
}

pub fn reserve_funds(account: &mut Account, amount: Decimal) -> LedgerResult<()> {
    if account.cash_available < amount {
        return Err(LedgerError::InsufficientFunds {
            have: account.cash_available,
            want: amount,
        });
    }
    account.cash_available -= amount;
    account.cash_blocked += amount;
    Ok(())
}

/// Inverse of `reserve_funds`. Clamps `cash_blocked` at zero if a sub-cent
/// rounding remainder would otherwise drive it negative.
pub fn release_funds(account: &mut Account, amount: Decimal) {
    let released = amount.min(account.cash_blocked);
    account.cash_blocked -= released;
    if account.cash_blocked < Decimal::ZERO {
        account.cash_blocked = Decimal::ZERO;
    }
    account.cash_available += released;
}

pub fn reserve_holdings(holding: &mut Holding, qty: i64) -> LedgerResult<()> {
    if holding.free_qty() < qty {
        return Err(LedgerError::InsufficientHoldings {
            symbol: holding.symbol.clone(),
            have: holding.free_qty(),
            want: qty,
        });
    }
    holding.reserved_qty += qty;
    Ok(())
}

pub fn release_holdings(holding: &mut Holding, qty: i64) {
    holding.reserved_qty = (holding.reserved_qty - qty).max(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_recomputes_weighted_average() {
        let mut h = Holding::empty(1, "ABC");
        apply_buy(&mut h, 40, dec!(49)).unwrap();
        assert_eq!(h.quantity, 40);
        assert_eq!(h.avg_price, dec!(49.0000));

        apply_buy(&mut h, 60, dec!(48)).unwrap();
        assert_eq!(h.quantity, 100);
        assert_eq!(h.avg_price, dec!(48.4000));
    }

    #[test]
    fn buy_rejects_non_positive_price() {
        let mut h = Holding::empty(1, "ABC");
        assert!(matches!(
            apply_buy(&mut h, 10, dec!(0)),
            Err(LedgerError::InvalidPrice)
        ));
    }

    #[test]
    fn sell_requires_sufficient_quantity() {
        let h = Holding::empty(1, "ABC");
        assert!(validate_sell(Some(&h), "ABC", 1).is_err());
        assert!(validate_sell(None, "ABC", 1).is_err());
    }

    #[test]
    fn reserve_then_release_funds_is_a_roundtrip() {
        let mut acct = Account::new(1, dec!(10000));
        reserve_funds(&mut acct, dec!(5000)).unwrap();
        assert_eq!(acct.cash_available, dec!(5000));
        assert_eq!(acct.cash_blocked, dec!(5000));
        release_funds(&mut acct, dec!(5000));
        assert_eq!(acct.cash_available, dec!(10000));
        assert_eq!(acct.cash_blocked, dec!(0));
    }

    #[test]
    fn reserve_holdings_respects_free_quantity() {
        let mut h = Holding::empty(1, "ABC");
        h.quantity = 50;
        reserve_holdings(&mut h, 20).unwrap();
        assert_eq!(h.reserved_qty, 20);
        assert!(reserve_holdings(&mut h, 40).is_err());
        release_holdings(&mut h, 100);
        assert_eq!(h.reserved_qty, 0);
    }
}
