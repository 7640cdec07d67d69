//! State Machine
//! Mission: Validate and apply position state transitions; emit state-change events atomically

use crate::domain::{EventPayload, Position, PositionStatus, TradeSignal};
use crate::error::{EngineError, EngineResult};
use crate::event_store;
use crate::persistence::sqlite;
use chrono::Utc;
use rusqlite::Transaction;
use uuid::Uuid;

/// Creates a PENDING position from an accepted signal and appends `POSITION_CREATED`.
/// Margin reservation happens in the caller's transaction via the risk ledger —
/// this function only establishes the position and its genesis event.
pub fn create_position(
    tx: &Transaction<'_>,
    signal: &TradeSignal,
) -> EngineResult<Position> {
    let now = Utc::now();
    let position = Position {
        position_id: Uuid::new_v4().to_string(),
        execution_trade_id: signal.id.clone(),
        account_id: signal.account_id.clone(),
        pair: signal.pair.clone(),
        side: signal.direction,
        size: rust_decimal::Decimal::ZERO,
        avg_entry_price: signal.entry_price,
        leverage: signal.leverage,
        margin_used: signal.margin_required,
        unrealized_pnl: rust_decimal::Decimal::ZERO,
        realized_pnl: rust_decimal::Decimal::ZERO,
        accrued_unrealized_commission: rust_decimal::Decimal::ZERO,
        stop_loss: signal.stop_loss,
        take_profit: signal.take_profit,
        status: PositionStatus::Pending,
        created_at: now,
        opened_at: None,
        closed_at: None,
        updated_at: now,
    };

    sqlite::upsert_position(tx, &position)?;

    let event = event_store::new_event(
        &position.position_id,
        None,
        Some(PositionStatus::Pending),
        EventPayload::PositionCreated {
            account_id: position.account_id.clone(),
            pair: position.pair.clone(),
            execution_trade_id: position.execution_trade_id.clone(),
            side: position.side,
            entry_price: position.avg_entry_price,
            leverage: position.leverage,
            margin_used: position.margin_used,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
        },
        None,
    );
    event_store::append(tx, event)?;

    Ok(position)
}

/// Validates `from -> to` against the transition table and, if legal, stamps the
/// appropriate timestamp and persists the new status. Does not append the event —
/// callers append the event that caused the transition (it carries the domain payload).
pub fn transition(
    tx: &Transaction<'_>,
    position: &mut Position,
    to: PositionStatus,
) -> EngineResult<()> {
    let from = position.status;
    if from == to {
        return Ok(());
    }
    if !from.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            position_id: position.position_id.clone(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    let now = Utc::now();
    position.status = to;
    position.updated_at = now;
    match to {
        PositionStatus::Open => position.opened_at = Some(now),
        PositionStatus::Closed | PositionStatus::Liquidated => position.closed_at = Some(now),
        _ => {}
    }

    sqlite::upsert_position(tx, position)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::persistence::SqliteGateway;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn test_signal() -> TradeSignal {
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
    async fn create_position_is_pending_with_zero_size() {
        use crate::persistence::PersistenceGateway;
        let gw = SqliteGateway::open_in_memory().unwrap();
        let signal = test_signal();
        let position = gw
            .transaction(move |tx| create_position(tx, &signal))
            .await
            .unwrap();

        assert_eq!(position.status, PositionStatus::Pending);
        assert_eq!(position.size, Decimal::ZERO);
        assert_eq!(position.avg_entry_price, Decimal::from_str("2000.00").unwrap());
        assert_eq!(position.unrealized_pnl, Decimal::ZERO);
        assert_eq!(position.realized_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn rejects_illegal_transition() {
        use crate::persistence::PersistenceGateway;
        let gw = SqliteGateway::open_in_memory().unwrap();
        let signal = test_signal();
        let mut position = gw
            .transaction(move |tx| create_position(tx, &signal))
            .await
            .unwrap();

        let result = gw
            .transaction(move |tx| transition(tx, &mut position, PositionStatus::Archived))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }
}
