//! Postgres-backed `LedgerStore`. Raw SQL throughout, no ORM: every query is
//! hand-written and every row is mapped by hand, matching how the rest of
//! this codebase talks to Postgres. A transaction is a checked-out pool
//! connection plus a `BEGIN`/`COMMIT`/`ROLLBACK` issued with `batch_execute`;
//! nothing below this module knows what a `deadpool_postgres::Object` is.

use std::collections::BTreeMap;
use std::future::Future;

use deadpool_postgres::{Object, Pool};
use ledger_core::audit::{self, AuditAction, AuditRecord};
use ledger_core::error::{LedgerError, LedgerResult};
use ledger_core::holdings::{Account, Holding};
use ledger_core::orders::{Order, OrderFill};
use ledger_core::store::LedgerStore;
use ledger_core::types::{OrderId, OrderStatus, Product, Side, UserId};
use rust_decimal::Decimal;
use serde_json::Value;
use time::OffsetDateTime;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;

fn db_err(context: &str, e: tokio_postgres::Error) -> LedgerError {
    LedgerError::InvariantViolation(format!("{context}: {e}"))
}

fn side_to_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn str_to_side(s: &str) -> LedgerResult<Side> {
    match s {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(LedgerError::InvariantViolation(format!("unknown side {other}"))),
    }
}

fn product_to_str(product: Product) -> &'static str {
    match product {
        Product::Equity => "equity",
        Product::Mtf => "mtf",
    }
}

fn str_to_product(s: &str) -> LedgerResult<Product> {
    match s {
        "equity" => Ok(Product::Equity),
        "mtf" => Ok(Product::Mtf),
        other => Err(LedgerError::InvariantViolation(format!("unknown product {other}"))),
    }
}

fn str_to_status(s: &str) -> LedgerResult<OrderStatus> {
    match s {
        "NEW" => Ok(OrderStatus::New),
        "ACCEPTED" => Ok(OrderStatus::Accepted),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELLED" => Ok(OrderStatus::Cancelled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        other => Err(LedgerError::InvariantViolation(format!("unknown order status {other}"))),
    }
}

fn row_to_account(row: &Row) -> Account {
    Account {
        user_id: row.get("user_id"),
        cash_available: row.get("cash_available"),
        cash_blocked: row.get("cash_blocked"),
    }
}

fn row_to_holding(row: &Row) -> Holding {
    Holding {
        user_id: row.get("user_id"),
        symbol: row.get("symbol"),
        quantity: row.get("quantity"),
        reserved_qty: row.get("reserved_qty"),
        avg_price: row.get("avg_price"),
    }
}

fn row_to_order(row: &Row) -> LedgerResult<Order> {
    Ok(Order {
        id: row.get("id"),
        user_id: row.get("user_id"),
        symbol: row.get("symbol"),
        quantity: row.get("quantity"),
        price: row.get("price"),
        side: str_to_side(row.get("side"))?,
        product: str_to_product(row.get("product"))?,
        status: str_to_status(row.get("status"))?,
        filled_qty: row.get("filled_qty"),
        avg_fill_price: row.get("avg_fill_price"),
        broker_order_id: row.get("broker_order_id"),
    })
}

fn row_to_fill(row: &Row) -> OrderFill {
    OrderFill {
        id: Some(row.get("id")),
        order_id: row.get("order_id"),
        broker_fill_id: row.get("broker_fill_id"),
        quantity: row.get("quantity"),
        price: row.get("price"),
        created_at: row.get("created_at"),
    }
}

fn parse_audit_action(action_str: &str) -> LedgerResult<AuditAction> {
    match action_str {
        "ORDER_ACCEPTED" => Ok(AuditAction::OrderAccepted),
        "ORDER_CANCELLED" => Ok(AuditAction::OrderCancelled),
        "ORDER_REJECTED" => Ok(AuditAction::OrderRejected),
        "FUNDS_DEBIT" => Ok(AuditAction::FundsDebit),
        "FUNDS_CREDIT" => Ok(AuditAction::FundsCredit),
        "HOLDINGS_RESERVED" => Ok(AuditAction::HoldingsReserved),
        "HOLDINGS_RELEASED" => Ok(AuditAction::HoldingsReleased),
        "FILL_APPLIED" => Ok(AuditAction::FillApplied),
        other => Err(LedgerError::InvariantViolation(format!("unknown audit action {other}"))),
    }
}

fn row_to_audit(row: &Row) -> LedgerResult<AuditRecord> {
    let details_json: Value = row.get("details");
    let details: BTreeMap<String, Value> = match details_json {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => BTreeMap::new(),
        other => {
            return Err(LedgerError::InvariantViolation(format!(
                "audit details column was not a JSON object: {other}"
            )))
        }
    };
    let action_str: String = row.get("action");
    Ok(AuditRecord {
        id: Some(row.get("id")),
        actor_id: row.get("actor_id"),
        target_id: row.get("target_id"),
        action: parse_audit_action(&action_str)?,
        description: row.get("description"),
        details,
        created_at: row.get("created_at"),
        prev_hash: row.get("prev_hash"),
        hash: row.get("hash"),
    })
}

pub struct PgTx {
    conn: Object,
}

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn create_pool(database_url: &str) -> Pool {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .expect("DATABASE_URL must be a valid postgres connection string");
        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr = deadpool_postgres::Manager::from_config(config, tokio_postgres::NoTls, mgr_config);
        Pool::builder(mgr).max_size(16).build().expect("pool configuration is valid")
    }

    /// Read-side only; not part of `LedgerStore` because nothing in the core
    /// mutates through it. Used by the chain-verification endpoint.
    pub async fn audit_history_for_target(&self, target_id: UserId) -> LedgerResult<Vec<AuditRecord>> {
        let conn = self.checked_out().await?;
        let rows = conn
            .query(
                "SELECT id, actor_id, target_id, action, description, details, created_at, prev_hash, hash
                 FROM audit_log WHERE target_id = $1 ORDER BY id",
                &[&target_id],
            )
            .await
            .map_err(|e| db_err("audit_history_for_target", e))?;
        rows.iter().map(row_to_audit).collect()
    }

    async fn checked_out(&self) -> LedgerResult<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| LedgerError::InvariantViolation(format!("pool exhausted: {e}")))
    }

    async fn insert_audit_once(
        conn: &Object,
        actor_id: Option<UserId>,
        target_id: UserId,
        action: AuditAction,
        description: &str,
        details: &BTreeMap<String, Value>,
    ) -> Result<AuditRecord, tokio_postgres::Error> {
        let prev_row = conn
            .query_opt("SELECT hash FROM audit_log ORDER BY id DESC LIMIT 1", &[])
            .await?;
        let prev_hash: Option<String> = prev_row.map(|r| r.get("hash"));
        let created_at = OffsetDateTime::now_utc();
        let record = audit::build_record(
            actor_id,
            target_id,
            action,
            description,
            details.clone(),
            prev_hash,
            created_at,
        );
        let row = conn
            .query_one(
                "INSERT INTO audit_log (actor_id, target_id, action, description, details, created_at, prev_hash, hash)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
                &[
                    &record.actor_id,
                    &record.target_id,
                    &record.action.to_string(),
                    &record.description,
                    &Value::Object(record.details.clone().into_iter().collect()),
                    &record.created_at,
                    &record.prev_hash,
                    &record.hash,
                ],
            )
            .await?;
        let mut record = record;
        record.id = Some(row.get("id"));
        Ok(record)
    }
}

impl LedgerStore for PgStore {
    type Tx = PgTx;

    fn begin(&self) -> impl Future<Output = LedgerResult<Self::Tx>> + Send {
        async move {
            let conn = self.checked_out().await?;
            conn.batch_execute("BEGIN").await.map_err(|e| db_err("BEGIN", e))?;
            Ok(PgTx { conn })
        }
    }

    fn commit(&self, tx: Self::Tx) -> impl Future<Output = LedgerResult<()>> + Send {
        async move { tx.conn.batch_execute("COMMIT").await.map_err(|e| db_err("COMMIT", e)) }
    }

    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = LedgerResult<()>> + Send {
        async move { tx.conn.batch_execute("ROLLBACK").await.map_err(|e| db_err("ROLLBACK", e)) }
    }

    fn trader_maps_to_client(
        &self,
        trader_id: UserId,
        client_id: UserId,
    ) -> impl Future<Output = LedgerResult<bool>> + Send {
        async move {
            let conn = self.checked_out().await?;
            let row = conn
                .query_one(
                    "SELECT EXISTS(SELECT 1 FROM trader_clients WHERE trader_id = $1 AND client_id = $2) AS present",
                    &[&trader_id, &client_id],
                )
                .await
                .map_err(|e| db_err("trader_maps_to_client", e))?;
            Ok(row.get("present"))
        }
    }

    fn lock_account(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
    ) -> impl Future<Output = LedgerResult<Account>> + Send {
        async move {
            let row = tx
                .conn
                .query_one(
                    "SELECT user_id, cash_available, cash_blocked FROM accounts WHERE user_id = $1 FOR UPDATE",
                    &[&user_id],
                )
                .await
                .map_err(|e| db_err("lock_account", e))?;
            Ok(row_to_account(&row))
        }
    }

    fn save_account(&self, tx: &mut Self::Tx, account: &Account) -> impl Future<Output = LedgerResult<()>> + Send {
        async move {
            tx.conn
                .execute(
                    "UPDATE accounts SET cash_available = $2, cash_blocked = $3 WHERE user_id = $1",
                    &[&account.user_id, &account.cash_available, &account.cash_blocked],
                )
                .await
                .map_err(|e| db_err("save_account", e))?;
            Ok(())
        }
    }

    fn lock_holding(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
        symbol: &str,
    ) -> impl Future<Output = LedgerResult<Option<Holding>>> + Send {
        let symbol = symbol.to_string();
        async move {
            let row = tx
                .conn
                .query_opt(
                    "SELECT user_id, symbol, quantity, reserved_qty, avg_price FROM holdings
                     WHERE user_id = $1 AND symbol = $2 FOR UPDATE",
                    &[&user_id, &symbol],
                )
                .await
                .map_err(|e| db_err("lock_holding", e))?;
            Ok(row.as_ref().map(row_to_holding))
        }
    }

    fn save_holding(&self, tx: &mut Self::Tx, holding: &Holding) -> impl Future<Output = LedgerResult<()>> + Send {
        async move {
            tx.conn
                .execute(
                    "INSERT INTO holdings (user_id, symbol, quantity, reserved_qty, avg_price)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (user_id, symbol) DO UPDATE
                     SET quantity = EXCLUDED.quantity, reserved_qty = EXCLUDED.reserved_qty, avg_price = EXCLUDED.avg_price",
                    &[
                        &holding.user_id,
                        &holding.symbol,
                        &holding.quantity,
                        &holding.reserved_qty,
                        &holding.avg_price,
                    ],
                )
                .await
                .map_err(|e| db_err("save_holding", e))?;
            Ok(())
        }
    }

    fn delete_holding(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
        symbol: &str,
    ) -> impl Future<Output = LedgerResult<()>> + Send {
        let symbol = symbol.to_string();
        async move {
            tx.conn
                .execute("DELETE FROM holdings WHERE user_id = $1 AND symbol = $2", &[&user_id, &symbol])
                .await
                .map_err(|e| db_err("delete_holding", e))?;
            Ok(())
        }
    }

    fn lock_order(&self, tx: &mut Self::Tx, order_id: OrderId) -> impl Future<Output = LedgerResult<Order>> + Send {
        async move {
            let row = tx
                .conn
                .query_opt(
                    "SELECT id, user_id, symbol, quantity, price, side, product, status, filled_qty,
                            avg_fill_price, broker_order_id
                     FROM orders WHERE id = $1 FOR UPDATE",
                    &[&order_id],
                )
                .await
                .map_err(|e| db_err("lock_order", e))?
                .ok_or(LedgerError::NotFound("order"))?;
            row_to_order(&row)
        }
    }

    fn insert_order(&self, tx: &mut Self::Tx, order: &Order) -> impl Future<Output = LedgerResult<OrderId>> + Send {
        async move {
            let row = tx
                .conn
                .query_one(
                    "INSERT INTO orders (user_id, symbol, quantity, price, side, product, status, filled_qty,
                                          avg_fill_price, broker_order_id)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
                    &[
                        &order.user_id,
                        &order.symbol,
                        &order.quantity,
                        &order.price,
                        &side_to_str(order.side),
                        &product_to_str(order.product),
                        &order.status.to_string(),
                        &order.filled_qty,
                        &order.avg_fill_price,
                        &order.broker_order_id,
                    ],
                )
                .await
                .map_err(|e| db_err("insert_order", e))?;
            Ok(row.get("id"))
        }
    }

    fn save_order(&self, tx: &mut Self::Tx, order: &Order) -> impl Future<Output = LedgerResult<()>> + Send {
        async move {
            tx.conn
                .execute(
                    "UPDATE orders SET status = $2, filled_qty = $3, avg_fill_price = $4, broker_order_id = $5
                     WHERE id = $1",
                    &[
                        &order.id,
                        &order.status.to_string(),
                        &order.filled_qty,
                        &order.avg_fill_price,
                        &order.broker_order_id,
                    ],
                )
                .await
                .map_err(|e| db_err("save_order", e))?;
            Ok(())
        }
    }

    fn fill_exists(
        &self,
        tx: &mut Self::Tx,
        order_id: OrderId,
        broker_fill_id: &str,
    ) -> impl Future<Output = LedgerResult<bool>> + Send {
        let broker_fill_id = broker_fill_id.to_string();
        async move {
            let row = tx
                .conn
                .query_one(
                    "SELECT EXISTS(SELECT 1 FROM order_fills WHERE order_id = $1 AND broker_fill_id = $2) AS present",
                    &[&order_id, &broker_fill_id],
                )
                .await
                .map_err(|e| db_err("fill_exists", e))?;
            Ok(row.get("present"))
        }
    }

    fn insert_fill(&self, tx: &mut Self::Tx, fill: &OrderFill) -> impl Future<Output = LedgerResult<()>> + Send {
        async move {
            tx.conn
                .execute(
                    "INSERT INTO order_fills (order_id, broker_fill_id, quantity, price, created_at)
                     VALUES ($1, $2, $3, $4, $5)",
                    &[&fill.order_id, &fill.broker_fill_id, &fill.quantity, &fill.price, &fill.created_at],
                )
                .await
                .map_err(|e| db_err("insert_fill", e))?;
            Ok(())
        }
    }

    fn fills_for_user(&self, user_id: UserId) -> impl Future<Output = LedgerResult<Vec<(Order, OrderFill)>>> + Send {
        async move {
            let conn = self.checked_out().await?;
            let rows = conn
                .query(
                    "SELECT o.id AS o_id, o.user_id AS o_user_id, o.symbol AS o_symbol, o.quantity AS o_quantity,
                            o.price AS o_price, o.side AS o_side, o.product AS o_product, o.status AS o_status,
                            o.filled_qty AS o_filled_qty, o.avg_fill_price AS o_avg_fill_price,
                            o.broker_order_id AS o_broker_order_id,
                            f.id AS id, f.order_id AS order_id, f.broker_fill_id AS broker_fill_id,
                            f.quantity AS quantity, f.price AS price, f.created_at AS created_at
                     FROM order_fills f JOIN orders o ON o.id = f.order_id
                     WHERE o.user_id = $1
                     ORDER BY f.created_at, f.id",
                    &[&user_id],
                )
                .await
                .map_err(|e| db_err("fills_for_user", e))?;

            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let order = Order {
                    id: row.get("o_id"),
                    user_id: row.get("o_user_id"),
                    symbol: row.get("o_symbol"),
                    quantity: row.get("o_quantity"),
                    price: row.get("o_price"),
                    side: str_to_side(row.get("o_side"))?,
                    product: str_to_product(row.get("o_product"))?,
                    status: str_to_status(row.get("o_status"))?,
                    filled_qty: row.get("o_filled_qty"),
                    avg_fill_price: row.get("o_avg_fill_price"),
                    broker_order_id: row.get("o_broker_order_id"),
                };
                out.push((order, row_to_fill(row)));
            }
            Ok(out)
        }
    }

    fn append_audit(
        &self,
        tx: &mut Self::Tx,
        actor_id: Option<UserId>,
        target_id: UserId,
        action: AuditAction,
        description: &str,
        details: BTreeMap<String, Value>,
    ) -> impl Future<Output = LedgerResult<AuditRecord>> + Send {
        async move {
            match Self::insert_audit_once(&tx.conn, actor_id, target_id, action, description, &details).await {
                Ok(record) => Ok(record),
                Err(e) if e.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE) => {
                    Self::insert_audit_once(&tx.conn, actor_id, target_id, action, description, &details)
                        .await
                        .map_err(|e| db_err("append_audit (retry)", e))
                }
                Err(e) => Err(db_err("append_audit", e)),
            }
        }
    }
}
