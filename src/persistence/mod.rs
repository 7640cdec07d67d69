//! Persistence Gateway
//! Mission: Transactional access to positions, events, executions, and balances

pub(crate) mod sqlite;

pub use sqlite::SqliteGateway;

use crate::domain::{
    AccountBalance, AccountBalanceEvent, Position, PositionEvent, PositionStatus,
    TradeExecution,
};
use crate::error::EngineResult;
use async_trait::async_trait;
use rusqlite::Transaction;

/// Ordering for `list_by_position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Transactional access to the engine's durable state.
///
/// All multi-row mutations (state transition + event, fill + execution + position
/// update, closure + balance event + margin release) run inside one `transaction`
/// call so they commit atomically or not at all, under SQLite's snapshot isolation.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Execute `f` against a single SQLite transaction. Commits on `Ok`, rolls back on `Err`.
    async fn transaction<F, T>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EngineResult<T> + Send,
        T: Send + 'static;

    async fn find_position(&self, position_id: &str) -> EngineResult<Option<Position>>;
    async fn find_positions_by_status(&self, status: PositionStatus) -> EngineResult<Vec<Position>>;
    async fn find_positions_by_account(&self, account_id: &str) -> EngineResult<Vec<Position>>;
    async fn find_open_positions_with_sltp(&self) -> EngineResult<Vec<Position>>;

    async fn list_events_by_position(
        &self,
        position_id: &str,
        order: Order,
    ) -> EngineResult<Vec<PositionEvent>>;
    async fn latest_event_by_position(
        &self,
        position_id: &str,
    ) -> EngineResult<Option<PositionEvent>>;
    async fn find_event_by_idempotency_key(
        &self,
        key: &str,
    ) -> EngineResult<Option<PositionEvent>>;
    async fn all_events(&self) -> EngineResult<Vec<PositionEvent>>;

    async fn list_executions_by_position(
        &self,
        position_id: &str,
    ) -> EngineResult<Vec<TradeExecution>>;

    async fn find_account_balance(&self, account_id: &str) -> EngineResult<Option<AccountBalance>>;
    async fn all_account_balances(&self) -> EngineResult<Vec<AccountBalance>>;
    async fn all_account_balance_events(&self) -> EngineResult<Vec<AccountBalanceEvent>>;
}

/// Synchronous helpers used from inside a `Transaction`, shared by every
/// component that composes multi-row writes into one atomic block.
pub(crate) mod txn {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    pub fn insert_position(tx: &Transaction<'_>, p: &Position) -> EngineResult<()> {
        tx.execute(
            "INSERT INTO positions (
                position_id, execution_trade_id, account_id, pair, side, size,
                avg_entry_price, leverage, margin_used, unrealized_pnl, realized_pnl,
                accrued_unrealized_commission, stop_loss, take_profit, status,
                created_at, opened_at, closed_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
            ON CONFLICT(position_id) DO UPDATE SET
                size = excluded.size,
                avg_entry_price = excluded.avg_entry_price,
                margin_used = excluded.margin_used,
                unrealized_pnl = excluded.unrealized_pnl,
                realized_pnl = excluded.realized_pnl,
                accrued_unrealized_commission = excluded.accrued_unrealized_commission,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                status = excluded.status,
                opened_at = excluded.opened_at,
                closed_at = excluded.closed_at,
                updated_at = excluded.updated_at",
            rusqlite::params![
                p.position_id,
                p.execution_trade_id,
                p.account_id,
                p.pair,
                side_str(p.side),
                p.size.to_string(),
                p.avg_entry_price.to_string(),
                p.leverage,
                p.margin_used.to_string(),
                p.unrealized_pnl.to_string(),
                p.realized_pnl.to_string(),
                p.accrued_unrealized_commission.to_string(),
                p.stop_loss.map(|d| d.to_string()),
                p.take_profit.map(|d| d.to_string()),
                p.status.as_str(),
                p.created_at.to_rfc3339(),
                p.opened_at.map(|t| t.to_rfc3339()),
                p.closed_at.map(|t| t.to_rfc3339()),
                p.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn side_str(side: crate::domain::Side) -> &'static str {
        match side {
            crate::domain::Side::Buy => "BUY",
            crate::domain::Side::Sell => "SELL",
        }
    }

    pub fn read_position_row(row: &rusqlite::Row) -> rusqlite::Result<Position> {
        let side_s: String = row.get("side")?;
        let status_s: String = row.get("status")?;
        let dec = |s: String| Decimal::from_str(&s).unwrap_or(Decimal::ZERO);
        let opt_dec = |s: Option<String>| s.map(dec);
        let ts = |s: String| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now())
        };
        let opt_ts = |s: Option<String>| s.map(ts);

        Ok(Position {
            position_id: row.get("position_id")?,
            execution_trade_id: row.get("execution_trade_id")?,
            account_id: row.get("account_id")?,
            pair: row.get("pair")?,
            side: if side_s == "BUY" {
                crate::domain::Side::Buy
            } else {
                crate::domain::Side::Sell
            },
            size: dec(row.get("size")?),
            avg_entry_price: dec(row.get("avg_entry_price")?),
            leverage: row.get("leverage")?,
            margin_used: dec(row.get("margin_used")?),
            unrealized_pnl: dec(row.get("unrealized_pnl")?),
            realized_pnl: dec(row.get("realized_pnl")?),
            accrued_unrealized_commission: dec(row.get("accrued_unrealized_commission")?),
            stop_loss: opt_dec(row.get("stop_loss")?),
            take_profit: opt_dec(row.get("take_profit")?),
            status: crate::domain::PositionStatus::from_str(&status_s)
                .unwrap_or(crate::domain::PositionStatus::Pending),
            created_at: ts(row.get("created_at")?),
            opened_at: opt_ts(row.get("opened_at")?),
            closed_at: opt_ts(row.get("closed_at")?),
            updated_at: ts(row.get("updated_at")?),
        })
    }
}
