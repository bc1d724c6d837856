//! Persistence boundary. Everything above this trait (holdings, fills,
//! lifecycle) is pure or orchestration-only; everything below it is a single
//! Postgres-backed implementation living in `ledger-http`, so the domain
//! logic in this crate never names `tokio-postgres` directly.
//!
//! All mutating methods take `&mut Self::Tx` and are expected to run inside
//! one transaction per use-case: the reservation and its audit row must
//! commit or roll back together (see "Suspension points" in the design --
//! no network I/O is allowed between a reservation and its audit write).

use std::collections::BTreeMap;
use std::future::Future;

use serde_json::Value;

use crate::audit::{AuditAction, AuditRecord};
use crate::error::LedgerResult;
use crate::holdings::{Account, Holding};
use crate::orders::{Order, OrderFill};
use crate::types::{OrderId, UserId};

pub trait LedgerStore: Send + Sync + 'static {
    /// An open transaction. Owns whatever connection/handle the concrete
    /// backend needs; callers never reach into it directly.
    type Tx: Send;

    fn begin(&self) -> impl Future<Output = LedgerResult<Self::Tx>> + Send;
    fn commit(&self, tx: Self::Tx) -> impl Future<Output = LedgerResult<()>> + Send;
    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = LedgerResult<()>> + Send;

    /// Authorization check: does this trader-client mapping exist? Always
    /// `true` when the deployment runs in debug mode.
    fn trader_maps_to_client(
        &self,
        trader_id: UserId,
        client_id: UserId,
    ) -> impl Future<Output = LedgerResult<bool>> + Send;

    /// Row-level lock on the user's cash fields, held for the rest of `tx`.
    fn lock_account(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
    ) -> impl Future<Output = LedgerResult<Account>> + Send;

    fn save_account(
        &self,
        tx: &mut Self::Tx,
        account: &Account,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    /// Row-level lock on (user_id, symbol). `None` if no holding row exists.
    fn lock_holding(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
        symbol: &str,
    ) -> impl Future<Output = LedgerResult<Option<Holding>>> + Send;

    fn save_holding(
        &self,
        tx: &mut Self::Tx,
        holding: &Holding,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn delete_holding(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
        symbol: &str,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    /// Row-level lock on the order, held for the rest of `tx`.
    fn lock_order(
        &self,
        tx: &mut Self::Tx,
        order_id: OrderId,
    ) -> impl Future<Output = LedgerResult<Order>> + Send;

    fn insert_order(
        &self,
        tx: &mut Self::Tx,
        order: &Order,
    ) -> impl Future<Output = LedgerResult<OrderId>> + Send;

    fn save_order(
        &self,
        tx: &mut Self::Tx,
        order: &Order,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    /// `true` if a fill with this idempotency key already exists.
    fn fill_exists(
        &self,
        tx: &mut Self::Tx,
        order_id: OrderId,
        broker_fill_id: &str,
    ) -> impl Future<Output = LedgerResult<bool>> + Send;

    fn insert_fill(
        &self,
        tx: &mut Self::Tx,
        fill: &OrderFill,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn fills_for_user(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = LedgerResult<Vec<(Order, OrderFill)>>> + Send;

    /// Loads `MAX(id)` under the same transaction as the append, builds the
    /// canonical payload, and inserts. A serialization-failure retry (1
    /// retry) is the implementation's responsibility since only it knows
    /// what the backend's isolation level reports.
    #[allow(clippy::too_many_arguments)]
    fn append_audit(
        &self,
        tx: &mut Self::Tx,
        actor_id: Option<UserId>,
        target_id: UserId,
        action: AuditAction,
        description: &str,
        details: BTreeMap<String, Value>,
    ) -> impl Future<Output = LedgerResult<AuditRecord>> + Send;
}
