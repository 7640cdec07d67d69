//! P&L Engine
//! Mission: Unrealized P&L against the live market price; position-level metrics

use crate::domain::{EventPayload, Position, PositionStatus};
use crate::error::EngineResult;
use crate::event_store;
use crate::persistence::sqlite;
use rust_decimal::Decimal;
use rusqlite::Transaction;
use serde::Serialize;

/// Recomputes `unrealizedPnL` for an OPEN position against `market_price` and
/// emits `POSITION_UPDATED`. No-op for non-OPEN positions.
pub fn update_position_pnl(
    tx: &Transaction<'_>,
    position: &mut Position,
    market_price: Decimal,
) -> EngineResult<()> {
    if position.status != PositionStatus::Open {
        return Ok(());
    }

    let side_sign = position.side.sign();
    let unrealized_pnl = (market_price - position.avg_entry_price) * position.size * side_sign
        - position.accrued_unrealized_commission;

    position.unrealized_pnl = unrealized_pnl;
    position.updated_at = chrono::Utc::now();
    sqlite::upsert_position(tx, position)?;

    let event = event_store::new_event(
        &position.position_id,
        Some(PositionStatus::Open),
        Some(PositionStatus::Open),
        EventPayload::PositionUpdated {
            market_price,
            unrealized_pnl,
        },
        None,
    );
    event_store::append(tx, event)?;

    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionMetrics {
    pub position_id: String,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub margin_used: Decimal,
    pub return_on_margin: Decimal,
}

pub fn get_position_metrics(position: &Position) -> PositionMetrics {
    PositionMetrics {
        position_id: position.position_id.clone(),
        unrealized_pnl: position.unrealized_pnl,
        realized_pnl: position.realized_pnl,
        margin_used: position.margin_used,
        return_on_margin: position.return_on_margin(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, TradeSignal};
    use crate::execution_tracker;
    use crate::persistence::{PersistenceGateway, SqliteGateway};
    use std::str::FromStr;

    #[tokio::test]
    async fn unrealized_pnl_formula_holds_within_tolerance() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let signal = TradeSignal {
            id: "sig-1".into(),
            account_id: "acct-1".into(),
            pair: "BTC-USD".into(),
            direction: Side::Buy,
            entry_price: Decimal::from_str("2000.00").unwrap(),
            position_size: Decimal::from_str("0.1").unwrap(),
            leverage: 100,
            margin_required: Decimal::from_str("200.00").unwrap(),
            stop_loss: Some(Decimal::from_str("1995").unwrap()),
            take_profit: Some(Decimal::from_str("2010").unwrap()),
        };
        let mut position = gw
            .transaction(move |tx| crate::state_machine::create_position(tx, &signal))
            .await
            .unwrap();

        let fill = crate::domain::FillData {
            order_id: "o1".into(),
            price: Decimal::from_str("2000.00").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        gw.transaction(move |tx| {
            execution_tracker::process_full_fill(tx, &mut position, &fill, true, Decimal::ZERO)
        })
        .await
        .unwrap();

        let mut position = gw
            .find_positions_by_account("acct-1")
            .await
            .unwrap()
            .remove(0);

        gw.transaction(move |tx| {
            update_position_pnl(tx, &mut position, Decimal::from_str("2005.00").unwrap())
        })
        .await
        .unwrap();

        let position = gw
            .find_positions_by_account("acct-1")
            .await
            .unwrap()
            .remove(0);

        // (2005 - 2000) * 0.1 = 0.50
        assert_eq!(position.unrealized_pnl, Decimal::from_str("0.50").unwrap());
    }
}
