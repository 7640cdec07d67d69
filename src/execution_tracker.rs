//! Execution Tracker
//! Mission: Record fills, recompute size/average entry price, and drive the state machine

use crate::domain::{EventPayload, ExecutionType, FillData, Position, PositionStatus, TradeExecution};
use crate::error::{EngineError, EngineResult};
use crate::event_store;
use crate::persistence::sqlite;
use crate::risk_ledger;
use rust_decimal::Decimal;
use rusqlite::Transaction;
use tracing::info;

/// Result of a fill application — tells the caller whether the fill just opened
/// the position (first entry) or closed it (last exit), so the facade can notify
/// the SL/TP monitor or the ledger as appropriate.
pub struct FillOutcome {
    pub position: Position,
    pub just_opened: bool,
    pub just_closed: bool,
    pub realized_pnl_delta: Decimal,
}

/// Appends a TradeExecution without mutating position size. Idempotent on
/// `(position_id, order_id)` — a duplicate is ignored by `INSERT OR IGNORE`.
pub fn record_execution(tx: &Transaction<'_>, exec: &TradeExecution) -> EngineResult<()> {
    sqlite::insert_execution(tx, exec)
}

fn commission_for(commission_rate: Decimal, price: Decimal, size: Decimal) -> Decimal {
    commission_rate * price * size
}

/// Core fill-application logic shared by partial and full fills: increments or
/// decrements size, recomputes weighted-average entry price on entries, and
/// accumulates realized P&L on exits.
fn apply_fill(
    tx: &Transaction<'_>,
    position: &mut Position,
    fill: &FillData,
    is_entry: bool,
    commission_rate: Decimal,
) -> EngineResult<(EventPayload, bool, Decimal)> {
    let side_sign = position.side.sign();
    let mut just_opened = false;
    let mut realized_pnl_delta = Decimal::ZERO;

    let (new_size, new_avg_entry_price);
    if is_entry {
        let old_size = position.size;
        let old_avg = position.avg_entry_price;
        let combined = old_size + fill.size;
        new_avg_entry_price = if combined.is_zero() {
            old_avg
        } else {
            (old_avg * old_size + fill.price * fill.size) / combined
        };
        new_size = combined;

        let commission = commission_for(commission_rate, fill.price, fill.size);
        position.accrued_unrealized_commission += commission;

        if old_size.is_zero() && new_size > Decimal::ZERO {
            just_opened = true;
        }
    } else {
        new_avg_entry_price = position.avg_entry_price;
        new_size = position.size - fill.size;

        let gross = (fill.price - position.avg_entry_price) * fill.size * side_sign;
        let commission = commission_for(commission_rate, fill.price, fill.size);
        realized_pnl_delta = gross - commission;
        position.realized_pnl += realized_pnl_delta;
    }

    position.size = new_size;
    position.avg_entry_price = new_avg_entry_price;
    position.updated_at = fill.executed_at;

    let payload = EventPayload::PartialFill {
        order_id: fill.order_id.clone(),
        price: fill.price,
        size: fill.size,
        is_entry,
        new_size,
        new_avg_entry_price,
        realized_pnl_delta,
    };

    sqlite::upsert_position(tx, position)?;

    Ok((payload, just_opened, realized_pnl_delta))
}

/// Processes a fill that does not necessarily bring the position to a terminal
/// size (size either remains positive after an exit, or grows after an entry).
pub fn process_partial_fill(
    tx: &Transaction<'_>,
    position: &mut Position,
    fill: &FillData,
    is_entry: bool,
    commission_rate: Decimal,
) -> EngineResult<FillOutcome> {
    let (payload, just_opened, realized_pnl_delta) =
        apply_fill(tx, position, fill, is_entry, commission_rate)?;

    let from_status = position.status;
    let event = event_store::new_event(&position.position_id, Some(from_status), Some(from_status), payload, None);
    event_store::append(tx, event)?;

    if just_opened {
        crate::state_machine::transition(tx, position, PositionStatus::Open)?;
        let opened_event = event_store::new_event(
            &position.position_id,
            Some(PositionStatus::Pending),
            Some(PositionStatus::Open),
            EventPayload::PositionOpened {
                avg_entry_price: position.avg_entry_price,
            },
            None,
        );
        event_store::append(tx, opened_event)?;
        info!(position_id = %position.position_id, "position opened on first entry fill");
    }

    Ok(FillOutcome {
        position: position.clone(),
        just_opened,
        just_closed: false,
        realized_pnl_delta,
    })
}

/// Processes a fill with the additional invariant that post-operation size is
/// zero (exit) or equals the originally signalled size (entry). On exit to zero
/// size: transitions to CLOSED, credits realized P&L, and releases margin.
pub fn process_full_fill(
    tx: &Transaction<'_>,
    position: &mut Position,
    fill: &FillData,
    is_entry: bool,
    commission_rate: Decimal,
) -> EngineResult<FillOutcome> {
    let mut outcome = process_partial_fill(tx, position, fill, is_entry, commission_rate)?;

    if !is_entry && position.size.is_zero() && position.status == PositionStatus::Open {
        let realized_pnl = position.realized_pnl;
        crate::state_machine::transition(tx, position, PositionStatus::Closed)?;

        let closed_event = event_store::new_event(
            &position.position_id,
            Some(PositionStatus::Open),
            Some(PositionStatus::Closed),
            EventPayload::PositionClosed {
                exit_price: fill.price,
                // The preceding PARTIAL_FILL event already carries this delta;
                // replay must not add it twice.
                realized_pnl: Decimal::ZERO,
            },
            None,
        );
        event_store::append(tx, closed_event)?;

        risk_ledger::settle_closure(
            tx,
            &position.account_id,
            &position.position_id,
            realized_pnl,
            position.margin_used,
        )?;

        position.margin_used = Decimal::ZERO;
        sqlite::upsert_position(tx, position)?;

        outcome.just_closed = true;
        outcome.position = position.clone();
        info!(position_id = %position.position_id, realized_pnl = %realized_pnl, "position closed on full exit");
    } else if is_entry {
        let expected_size = position.size;
        if expected_size.is_zero() {
            return Err(EngineError::Internal(format!(
                "full entry fill left position {} at zero size",
                position.position_id
            )));
        }
    }

    Ok(outcome)
}

/// Closure path used by the SL/TP monitor and the liquidation engine: settles the
/// exit at `exit_price`, tagged with `execution_type`, under the given idempotency key.
pub fn close_at_price(
    tx: &Transaction<'_>,
    position: &mut Position,
    exit_price: Decimal,
    execution_type: ExecutionType,
    order_id: &str,
    commission_rate: Decimal,
    liquidation_fee: Decimal,
) -> EngineResult<Decimal> {
    let side_sign = position.side.sign();
    let size = position.size;
    let gross = (exit_price - position.avg_entry_price) * size * side_sign;
    let commission = commission_for(commission_rate, exit_price, size);
    let realized_pnl = gross - commission - liquidation_fee;

    let exec = TradeExecution {
        position_id: position.position_id.clone(),
        order_id: order_id.to_string(),
        execution_type,
        price: exit_price,
        size,
        executed_at: chrono::Utc::now(),
    };
    record_execution(tx, &exec)?;

    position.realized_pnl += realized_pnl;
    position.size = Decimal::ZERO;
    position.unrealized_pnl = Decimal::ZERO;
    position.updated_at = exec.executed_at;

    Ok(realized_pnl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, TradeSignal};
    use crate::persistence::{PersistenceGateway, SqliteGateway};
    use std::str::FromStr;

    fn signal() -> TradeSignal {
        TradeSignal {
            id: "sig-1".into(),
            account_id: "acct-1".into(),
            pair: "BTC-USD".into(),
            direction: Side::Buy,
            entry_price: Decimal::from_str("2000.00").unwrap(),
            position_size: Decimal::from_str("0.1").unwrap(),
            leverage: 10,
            margin_required: Decimal::from_str("200.00").unwrap(),
            stop_loss: Some(Decimal::from_str("1995").unwrap()),
            take_profit: Some(Decimal::from_str("2010").unwrap()),
        }
    }

    #[tokio::test]
    async fn full_entry_fill_opens_position() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let sig = signal();
        let mut position = gw
            .transaction(move |tx| crate::state_machine::create_position(tx, &sig))
            .await
            .unwrap();

        let fill = FillData {
            order_id: "o1".into(),
            price: Decimal::from_str("2000.00").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };

        let outcome = gw
            .transaction(move |tx| {
                process_full_fill(tx, &mut position, &fill, true, Decimal::ZERO)
            })
            .await
            .unwrap();

        assert!(outcome.just_opened);
        assert_eq!(outcome.position.status, PositionStatus::Open);
        assert_eq!(outcome.position.size, Decimal::from_str("0.1").unwrap());
        assert_eq!(
            outcome.position.avg_entry_price,
            Decimal::from_str("2000.00").unwrap()
        );
    }

    #[tokio::test]
    async fn weighted_average_entry_price_on_two_partial_fills() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let mut sig = signal();
        sig.direction = Side::Sell;
        sig.entry_price = Decimal::from_str("1950").unwrap();
        let mut position = gw
            .transaction(move |tx| crate::state_machine::create_position(tx, &sig))
            .await
            .unwrap();

        let fill_a = FillData {
            order_id: "o1".into(),
            price: Decimal::from_str("1950").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        gw.transaction(move |tx| process_partial_fill(tx, &mut position, &fill_a, true, Decimal::ZERO))
            .await
            .unwrap();

        let mut position = only_position(&gw).await;
        let fill_b = FillData {
            order_id: "o2".into(),
            price: Decimal::from_str("1949.50").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        gw.transaction(move |tx| process_partial_fill(tx, &mut position, &fill_b, true, Decimal::ZERO))
            .await
            .unwrap();

        let final_position = only_position(&gw).await;
        assert_eq!(final_position.size, Decimal::from_str("0.2").unwrap());
        assert_eq!(
            final_position.avg_entry_price,
            Decimal::from_str("1949.75").unwrap()
        );
    }

    #[tokio::test]
    async fn full_exit_fill_realized_pnl_survives_replay() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let sig = signal();
        let mut position = gw
            .transaction(move |tx| crate::state_machine::create_position(tx, &sig))
            .await
            .unwrap();

        let entry = FillData {
            order_id: "o1".into(),
            price: Decimal::from_str("2000.00").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        gw.transaction(move |tx| process_full_fill(tx, &mut position, &entry, true, Decimal::ZERO))
            .await
            .unwrap();

        let mut position = only_position(&gw).await;
        let exit = FillData {
            order_id: "o2".into(),
            price: Decimal::from_str("2010.00").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        let outcome = gw
            .transaction(move |tx| process_full_fill(tx, &mut position, &exit, false, Decimal::ZERO))
            .await
            .unwrap();

        assert!(outcome.just_closed);
        assert_eq!(outcome.position.status, PositionStatus::Closed);
        assert_eq!(outcome.position.realized_pnl, Decimal::from_str("1.00").unwrap());

        let events = gw
            .list_events_by_position(&outcome.position.position_id, crate::persistence::Order::Ascending)
            .await
            .unwrap();
        let replayed = crate::event_store::replay(&events).unwrap().unwrap();
        assert_eq!(replayed.realized_pnl, outcome.position.realized_pnl);
        assert_eq!(replayed.status, outcome.position.status);
    }

    async fn only_position(gw: &SqliteGateway) -> Position {
        gw.find_positions_by_account("acct-1")
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("position exists")
    }
}
