//! SQLite-backed Persistence Gateway
//! Mission: Concrete transactional storage for positions, events, executions, and balances

use super::{txn, Order, PersistenceGateway};
use crate::domain::{
    AccountBalance, AccountBalanceEvent, BalanceReason, EventPayload, Position,
    PositionEvent, PositionStatus, TradeExecution,
};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Owns the one SQLite connection for the engine's durable state, the same way
/// the lineage's vault database wraps a single connection behind a tokio mutex
/// rather than pooling — all engine writes are small and serialized by design.
#[derive(Clone)]
pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGateway {
    pub fn open(db_path: &str) -> EngineResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn init_schema(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS positions (
            position_id TEXT PRIMARY KEY,
            execution_trade_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            pair TEXT NOT NULL,
            side TEXT NOT NULL,
            size TEXT NOT NULL,
            avg_entry_price TEXT NOT NULL,
            leverage INTEGER NOT NULL,
            margin_used TEXT NOT NULL,
            unrealized_pnl TEXT NOT NULL,
            realized_pnl TEXT NOT NULL,
            accrued_unrealized_commission TEXT NOT NULL,
            stop_loss TEXT,
            take_profit TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            opened_at TEXT,
            closed_at TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_positions_account ON positions(account_id);
        CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

        CREATE TABLE IF NOT EXISTS position_events (
            id TEXT PRIMARY KEY,
            position_id TEXT NOT NULL,
            previous_status TEXT,
            new_status TEXT,
            payload TEXT NOT NULL,
            idempotency_key TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_position ON position_events(position_id, created_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_events_idempotency
            ON position_events(idempotency_key) WHERE idempotency_key IS NOT NULL;

        CREATE TABLE IF NOT EXISTS trade_executions (
            position_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            execution_type TEXT NOT NULL,
            price TEXT NOT NULL,
            size TEXT NOT NULL,
            executed_at TEXT NOT NULL,
            PRIMARY KEY (position_id, order_id, execution_type)
        );
        CREATE INDEX IF NOT EXISTS idx_executions_position ON trade_executions(position_id);

        CREATE TABLE IF NOT EXISTS account_balances (
            account_id TEXT PRIMARY KEY,
            equity TEXT NOT NULL,
            balance TEXT NOT NULL,
            margin_used TEXT NOT NULL,
            free_margin TEXT NOT NULL,
            leverage INTEGER NOT NULL,
            is_paper INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS account_balance_events (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            balance_before TEXT NOT NULL,
            amount TEXT NOT NULL,
            balance_after TEXT NOT NULL,
            reason TEXT NOT NULL,
            position_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_balance_events_account ON account_balance_events(account_id, created_at);",
    )
    .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn transaction<F, T>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EngineResult<T> + Send,
        T: Send + 'static,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_position(&self, position_id: &str) -> EngineResult<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM positions WHERE position_id = ?1")
            .map_err(EngineError::from)?;
        let mut rows = stmt.query(params![position_id]).map_err(EngineError::from)?;
        if let Some(row) = rows.next().map_err(EngineError::from)? {
            Ok(Some(txn::read_position_row(row).map_err(EngineError::from)?))
        } else {
            Ok(None)
        }
    }

    async fn find_positions_by_status(&self, status: PositionStatus) -> EngineResult<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM positions WHERE status = ?1")
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![status.as_str()], txn::read_position_row)
            .map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    async fn find_positions_by_account(&self, account_id: &str) -> EngineResult<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM positions WHERE account_id = ?1")
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![account_id], txn::read_position_row)
            .map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    async fn find_open_positions_with_sltp(&self) -> EngineResult<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM positions WHERE status = 'OPEN'
                 AND (stop_loss IS NOT NULL OR take_profit IS NOT NULL)",
            )
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map([], txn::read_position_row)
            .map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    async fn list_events_by_position(
        &self,
        position_id: &str,
        order: Order,
    ) -> EngineResult<Vec<PositionEvent>> {
        let conn = self.conn.lock().await;
        let order_sql = match order {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        };
        let sql = format!(
            "SELECT * FROM position_events WHERE position_id = ?1 ORDER BY created_at {}",
            order_sql
        );
        let mut stmt = conn.prepare(&sql).map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![position_id], read_event_row)
            .map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    async fn latest_event_by_position(
        &self,
        position_id: &str,
    ) -> EngineResult<Option<PositionEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM position_events WHERE position_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
            )
            .map_err(EngineError::from)?;
        let mut rows = stmt.query(params![position_id]).map_err(EngineError::from)?;
        if let Some(row) = rows.next().map_err(EngineError::from)? {
            Ok(Some(read_event_row(row).map_err(EngineError::from)?))
        } else {
            Ok(None)
        }
    }

    async fn find_event_by_idempotency_key(
        &self,
        key: &str,
    ) -> EngineResult<Option<PositionEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM position_events WHERE idempotency_key = ?1")
            .map_err(EngineError::from)?;
        let mut rows = stmt.query(params![key]).map_err(EngineError::from)?;
        if let Some(row) = rows.next().map_err(EngineError::from)? {
            Ok(Some(read_event_row(row).map_err(EngineError::from)?))
        } else {
            Ok(None)
        }
    }

    async fn all_events(&self) -> EngineResult<Vec<PositionEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM position_events ORDER BY created_at ASC")
            .map_err(EngineError::from)?;
        let rows = stmt.query_map([], read_event_row).map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    async fn list_executions_by_position(
        &self,
        position_id: &str,
    ) -> EngineResult<Vec<TradeExecution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM trade_executions WHERE position_id = ?1 ORDER BY executed_at ASC",
            )
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![position_id], read_execution_row)
            .map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    async fn find_account_balance(&self, account_id: &str) -> EngineResult<Option<AccountBalance>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM account_balances WHERE account_id = ?1")
            .map_err(EngineError::from)?;
        let mut rows = stmt.query(params![account_id]).map_err(EngineError::from)?;
        if let Some(row) = rows.next().map_err(EngineError::from)? {
            Ok(Some(read_balance_row(row).map_err(EngineError::from)?))
        } else {
            Ok(None)
        }
    }

    async fn all_account_balances(&self) -> EngineResult<Vec<AccountBalance>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM account_balances")
            .map_err(EngineError::from)?;
        let rows = stmt.query_map([], read_balance_row).map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    async fn all_account_balance_events(&self) -> EngineResult<Vec<AccountBalanceEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM account_balance_events ORDER BY created_at ASC")
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map([], read_balance_event_row)
            .map_err(EngineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }
}

fn dec(s: String) -> Decimal {
    Decimal::from_str(&s).unwrap_or(Decimal::ZERO)
}

fn ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn read_event_row(row: &rusqlite::Row) -> rusqlite::Result<PositionEvent> {
    let payload_json: String = row.get("payload")?;
    let payload: EventPayload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let prev: Option<String> = row.get("previous_status")?;
    let new: Option<String> = row.get("new_status")?;
    Ok(PositionEvent {
        id: row.get("id")?,
        position_id: row.get("position_id")?,
        previous_status: prev.and_then(|s| PositionStatus::from_str(&s)),
        new_status: new.and_then(|s| PositionStatus::from_str(&s)),
        payload,
        idempotency_key: row.get("idempotency_key")?,
        created_at: ts(row.get("created_at")?),
    })
}

fn read_execution_row(row: &rusqlite::Row) -> rusqlite::Result<TradeExecution> {
    let exec_type_s: String = row.get("execution_type")?;
    let execution_type = match exec_type_s.as_str() {
        "ENTRY" => crate::domain::ExecutionType::Entry,
        "PARTIAL_EXIT" => crate::domain::ExecutionType::PartialExit,
        "STOP_LOSS" => crate::domain::ExecutionType::StopLoss,
        "TAKE_PROFIT" => crate::domain::ExecutionType::TakeProfit,
        _ => crate::domain::ExecutionType::Liquidation,
    };
    Ok(TradeExecution {
        position_id: row.get("position_id")?,
        order_id: row.get("order_id")?,
        execution_type,
        price: dec(row.get("price")?),
        size: dec(row.get("size")?),
        executed_at: ts(row.get("executed_at")?),
    })
}

fn read_balance_row(row: &rusqlite::Row) -> rusqlite::Result<AccountBalance> {
    Ok(AccountBalance {
        account_id: row.get("account_id")?,
        equity: dec(row.get("equity")?),
        balance: dec(row.get("balance")?),
        margin_used: dec(row.get("margin_used")?),
        free_margin: dec(row.get("free_margin")?),
        leverage: row.get("leverage")?,
        is_paper: row.get::<_, i64>("is_paper")? != 0,
    })
}

fn read_balance_event_row(row: &rusqlite::Row) -> rusqlite::Result<AccountBalanceEvent> {
    let reason_s: String = row.get("reason")?;
    let reason = match reason_s.as_str() {
        "PARTIAL_EXIT" => BalanceReason::PartialExit,
        "POSITION_CLOSED" => BalanceReason::PositionClosed,
        "LIQUIDATION" => BalanceReason::Liquidation,
        "MARGIN_RESERVE" => BalanceReason::MarginReserve,
        "MARGIN_RELEASE" => BalanceReason::MarginRelease,
        _ => BalanceReason::Fee,
    };
    Ok(AccountBalanceEvent {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        balance_before: dec(row.get("balance_before")?),
        amount: dec(row.get("amount")?),
        balance_after: dec(row.get("balance_after")?),
        reason,
        position_id: row.get("position_id")?,
        created_at: ts(row.get("created_at")?),
    })
}

/// Helpers for components that need to write inside a caller-managed transaction.
pub(crate) fn insert_event(tx: &Transaction<'_>, event: &PositionEvent) -> EngineResult<()> {
    let payload_json =
        serde_json::to_string(&event.payload).map_err(|e| EngineError::Internal(e.to_string()))?;
    tx.execute(
        "INSERT INTO position_events
            (id, position_id, previous_status, new_status, payload, idempotency_key, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            event.id,
            event.position_id,
            event.previous_status.map(|s| s.as_str()),
            event.new_status.map(|s| s.as_str()),
            payload_json,
            event.idempotency_key,
            event.created_at.to_rfc3339(),
        ],
    )
    .map_err(EngineError::from)?;
    Ok(())
}

pub(crate) fn find_event_by_idempotency_key_tx(
    tx: &Transaction<'_>,
    key: &str,
) -> EngineResult<Option<PositionEvent>> {
    let mut stmt = tx
        .prepare("SELECT * FROM position_events WHERE idempotency_key = ?1")
        .map_err(EngineError::from)?;
    let mut rows = stmt.query(params![key]).map_err(EngineError::from)?;
    if let Some(row) = rows.next().map_err(EngineError::from)? {
        Ok(Some(read_event_row(row).map_err(EngineError::from)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn find_position_tx(
    tx: &Transaction<'_>,
    position_id: &str,
) -> EngineResult<Option<Position>> {
    let mut stmt = tx
        .prepare("SELECT * FROM positions WHERE position_id = ?1")
        .map_err(EngineError::from)?;
    let mut rows = stmt.query(params![position_id]).map_err(EngineError::from)?;
    if let Some(row) = rows.next().map_err(EngineError::from)? {
        Ok(Some(txn::read_position_row(row).map_err(EngineError::from)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn upsert_position(tx: &Transaction<'_>, p: &Position) -> EngineResult<()> {
    txn::insert_position(tx, p)
}

pub(crate) fn find_account_balance_tx(
    tx: &Transaction<'_>,
    account_id: &str,
) -> EngineResult<Option<AccountBalance>> {
    let mut stmt = tx
        .prepare("SELECT * FROM account_balances WHERE account_id = ?1")
        .map_err(EngineError::from)?;
    let mut rows = stmt.query(params![account_id]).map_err(EngineError::from)?;
    if let Some(row) = rows.next().map_err(EngineError::from)? {
        Ok(Some(read_balance_row(row).map_err(EngineError::from)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn upsert_account_balance(tx: &Transaction<'_>, b: &AccountBalance) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO account_balances
            (account_id, equity, balance, margin_used, free_margin, leverage, is_paper)
         VALUES (?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(account_id) DO UPDATE SET
            equity = excluded.equity,
            balance = excluded.balance,
            margin_used = excluded.margin_used,
            free_margin = excluded.free_margin,
            leverage = excluded.leverage,
            is_paper = excluded.is_paper",
        params![
            b.account_id,
            b.equity.to_string(),
            b.balance.to_string(),
            b.margin_used.to_string(),
            b.free_margin.to_string(),
            b.leverage,
            b.is_paper as i64,
        ],
    )
    .map_err(EngineError::from)?;
    Ok(())
}

pub(crate) fn insert_balance_event(
    tx: &Transaction<'_>,
    e: &AccountBalanceEvent,
) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO account_balance_events
            (id, account_id, balance_before, amount, balance_after, reason, position_id, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            e.id,
            e.account_id,
            e.balance_before.to_string(),
            e.amount.to_string(),
            e.balance_after.to_string(),
            e.reason.as_str(),
            e.position_id,
            e.created_at.to_rfc3339(),
        ],
    )
    .map_err(EngineError::from)?;
    Ok(())
}

pub(crate) fn insert_execution(tx: &Transaction<'_>, e: &TradeExecution) -> EngineResult<()> {
    tx.execute(
        "INSERT OR IGNORE INTO trade_executions
            (position_id, order_id, execution_type, price, size, executed_at)
         VALUES (?1,?2,?3,?4,?5,?6)",
        params![
            e.position_id,
            e.order_id,
            e.execution_type.as_str(),
            e.price.to_string(),
            e.size.to_string(),
            e.executed_at.to_rfc3339(),
        ],
    )
    .map_err(EngineError::from)?;
    Ok(())
}

pub(crate) fn sum_margin_used_for_open_positions(
    tx: &Transaction<'_>,
    account_id: &str,
) -> EngineResult<Decimal> {
    let mut stmt = tx
        .prepare("SELECT margin_used FROM positions WHERE account_id = ?1 AND status = 'OPEN'")
        .map_err(EngineError::from)?;
    let rows = stmt
        .query_map(params![account_id], |row| row.get::<_, String>(0))
        .map_err(EngineError::from)?;
    let mut total = Decimal::ZERO;
    for r in rows {
        total += dec(r.map_err(EngineError::from)?);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_schema_in_memory() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let positions = gw.find_positions_by_status(PositionStatus::Open).await.unwrap();
        assert!(positions.is_empty());
    }
}
