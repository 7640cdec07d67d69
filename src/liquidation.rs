//! Liquidation Engine
//! Mission: Force-close positions on accounts whose margin check reports liquidation

use crate::config::EngineConfig;
use crate::domain::{EventPayload, ExecutionType, Position, PositionStatus};
use crate::error::EngineResult;
use crate::execution_tracker;
use crate::persistence::PersistenceGateway;
use crate::risk_ledger;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct LiquidationReport {
    pub account_id: String,
    pub closed_position_ids: Vec<String>,
    pub failed_position_ids: Vec<String>,
}

/// Orders an account's OPEN positions largest-loss-first — the policy used to
/// pick which positions to force-close until margin recovers.
fn order_by_largest_loss(mut positions: Vec<Position>) -> Vec<Position> {
    positions.sort_by(|a, b| {
        let a_loss = a.unrealized_pnl + a.realized_pnl;
        let b_loss = b.unrealized_pnl + b.realized_pnl;
        a_loss.cmp(&b_loss)
    });
    positions
}

/// Force-closes positions on `account_id` until the margin check no longer
/// reports `liquidationTriggered`, capped at the account's OPEN positions.
/// Partial success is reported; the account is never left half-liquidated —
/// each individual closure is its own atomic transaction.
pub async fn liquidate_account(
    gateway: &Arc<dyn PersistenceGateway>,
    config: &EngineConfig,
    account_id: &str,
) -> EngineResult<LiquidationReport> {
    let open_positions = gateway.find_positions_by_account(account_id).await?;
    let open_positions: Vec<Position> = open_positions
        .into_iter()
        .filter(|p| p.status == PositionStatus::Open)
        .collect();
    let ordered = order_by_largest_loss(open_positions);

    let mut report = LiquidationReport {
        account_id: account_id.to_string(),
        closed_position_ids: Vec::new(),
        failed_position_ids: Vec::new(),
    };

    for position in ordered {
        let status = gateway
            .transaction({
                let account_id = account_id.to_string();
                let margin_call = config.margin_call_level;
                let liquidation = config.liquidation_level;
                move |tx| risk_ledger::check_margin_requirements(tx, &account_id, margin_call, liquidation)
            })
            .await?;

        if !status.liquidation_triggered {
            break;
        }

        match liquidate_position(gateway, config, position.clone()).await {
            Ok(_) => {
                info!(position_id = %position.position_id, account_id = %account_id, "position liquidated");
                report.closed_position_ids.push(position.position_id);
            }
            Err(e) => {
                error!(position_id = %position.position_id, error = %e, "liquidation failed for position");
                report.failed_position_ids.push(position.position_id);
            }
        }
    }

    if !report.failed_position_ids.is_empty() {
        warn!(account_id = %account_id, failed = report.failed_position_ids.len(), "liquidation sweep reported partial failure");
    }

    Ok(report)
}

async fn liquidate_position(
    gateway: &Arc<dyn PersistenceGateway>,
    config: &EngineConfig,
    mut position: Position,
) -> EngineResult<()> {
    let commission_rate = config.commission_rate;
    let liquidation_fee_rate = config.liquidation_fee_percent / Decimal::from(100);
    let exit_price = position.avg_entry_price
        + (position.unrealized_pnl / position.size.max(Decimal::new(1, 8))) * position.side.sign();

    gateway
        .transaction(move |tx| {
            let notional = exit_price * position.size;
            let liquidation_fee = notional.abs() * liquidation_fee_rate;

            let realized_pnl = execution_tracker::close_at_price(
                tx,
                &mut position,
                exit_price,
                ExecutionType::Liquidation,
                &format!("liquidation-{}", position.position_id),
                commission_rate,
                liquidation_fee,
            )?;

            let event = crate::event_store::new_event(
                &position.position_id,
                Some(PositionStatus::Open),
                Some(PositionStatus::Liquidated),
                EventPayload::PositionLiquidated {
                    exit_price,
                    realized_pnl,
                    liquidation_fee,
                },
                None,
            );
            crate::event_store::append(tx, event)?;

            crate::state_machine::transition(tx, &mut position, PositionStatus::Liquidated)?;

            let margin_used = position.margin_used;
            position.margin_used = Decimal::ZERO;
            crate::persistence::sqlite::upsert_position(tx, &position)?;

            risk_ledger::settle_closure(
                tx,
                &position.account_id,
                &position.position_id,
                realized_pnl,
                margin_used,
            )?;

            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::str::FromStr;

    fn position_with_pnl(id: &str, pnl: &str) -> Position {
        Position {
            position_id: id.into(),
            execution_trade_id: "sig".into(),
            account_id: "acct-1".into(),
            pair: "BTC-USD".into(),
            side: crate::domain::Side::Buy,
            size: Decimal::from_str("0.1").unwrap(),
            avg_entry_price: Decimal::from_str("2000").unwrap(),
            leverage: 100,
            margin_used: Decimal::from_str("20").unwrap(),
            unrealized_pnl: Decimal::from_str(pnl).unwrap(),
            realized_pnl: Decimal::ZERO,
            accrued_unrealized_commission: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            status: PositionStatus::Open,
            created_at: Utc::now(),
            opened_at: Some(Utc::now()),
            closed_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn orders_largest_loss_first() {
        let positions = vec![
            position_with_pnl("a", "-5.00"),
            position_with_pnl("b", "-50.00"),
            position_with_pnl("c", "10.00"),
        ];
        let ordered = order_by_largest_loss(positions);
        assert_eq!(ordered[0].position_id, "b");
        assert_eq!(ordered[1].position_id, "a");
        assert_eq!(ordered[2].position_id, "c");
    }
}
