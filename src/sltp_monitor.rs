//! SL/TP Monitor
//! Mission: Route market prices to monitored positions and trigger idempotent closure

use crate::config::EngineConfig;
use crate::domain::{ExecutionType, Position, PositionStatus, Side};
use crate::error::EngineResult;
use crate::execution_tracker;
use crate::persistence::PersistenceGateway;
use crate::risk_ledger;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
}

/// In-memory routing index: `symbol -> monitored position ids`. Rehydrated
/// periodically from the persistent store rather than trusted as durable state.
pub struct SltpMonitor {
    watch: Mutex<HashMap<String, HashSet<String>>>,
}

impl SltpMonitor {
    pub fn new() -> Self {
        Self {
            watch: Mutex::new(HashMap::new()),
        }
    }

    pub async fn arm(&self, pair: &str, position_id: &str) {
        let mut watch = self.watch.lock().await;
        watch.entry(pair.to_string()).or_default().insert(position_id.to_string());
    }

    pub async fn disarm(&self, pair: &str, position_id: &str) {
        let mut watch = self.watch.lock().await;
        if let Some(set) = watch.get_mut(pair) {
            set.remove(position_id);
        }
    }

    pub async fn watched(&self, pair: &str) -> Vec<String> {
        let watch = self.watch.lock().await;
        watch
            .get(pair)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rebuilds the watch list from persisted OPEN positions with SL or TP set —
    /// used on `initialize()` and on each `monitoringIntervalMs` tick.
    pub async fn rehydrate(&self, gateway: &Arc<dyn PersistenceGateway>) -> EngineResult<()> {
        let positions = gateway.find_open_positions_with_sltp().await?;
        let mut watch = self.watch.lock().await;
        watch.clear();
        for p in positions {
            watch.entry(p.pair.clone()).or_default().insert(p.position_id.clone());
        }
        debug!(pairs = watch.len(), "sltp watch list rehydrated");
        Ok(())
    }
}

impl Default for SltpMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Trigger rule for a market price `p` (§4.7). BUY: SL iff `p <= stopLoss`, TP
/// iff `p >= takeProfit`. SELL: inverse.
pub fn check_trigger(position: &Position, price: Decimal) -> Option<TriggerKind> {
    if position.status != PositionStatus::Open {
        return None;
    }
    match position.side {
        Side::Buy => {
            if let Some(sl) = position.stop_loss {
                if price <= sl {
                    return Some(TriggerKind::StopLoss);
                }
            }
            if let Some(tp) = position.take_profit {
                if price >= tp {
                    return Some(TriggerKind::TakeProfit);
                }
            }
        }
        Side::Sell => {
            if let Some(sl) = position.stop_loss {
                if price >= sl {
                    return Some(TriggerKind::StopLoss);
                }
            }
            if let Some(tp) = position.take_profit {
                if price <= tp {
                    return Some(TriggerKind::TakeProfit);
                }
            }
        }
    }
    None
}

pub fn idempotency_key(position_id: &str, trigger_timestamp_millis: i64) -> String {
    format!("close_{}_{}", position_id, trigger_timestamp_millis)
}

/// Executes the closure path for a triggered position: appends the trigger
/// event under its idempotency key (aborting silently if already recorded),
/// then runs the execution tracker's exit-to-zero path and settles the ledger.
pub async fn execute_trigger(
    gateway: &Arc<dyn PersistenceGateway>,
    config: &EngineConfig,
    mut position: Position,
    kind: TriggerKind,
    trigger_price: Decimal,
    trigger_timestamp_millis: i64,
) -> EngineResult<Position> {
    use crate::domain::EventPayload;
    use crate::event_store;

    let key = idempotency_key(&position.position_id, trigger_timestamp_millis);
    let execution_type = match kind {
        TriggerKind::StopLoss => ExecutionType::StopLoss,
        TriggerKind::TakeProfit => ExecutionType::TakeProfit,
    };
    let commission_rate = config.commission_rate;

    let result = gateway
        .transaction(move |tx| {
            // Check-then-append under the same transaction: no concurrent writer
            // can observe the gap, so this is equivalent to an atomic insert-if-absent.
            if crate::persistence::sqlite::find_event_by_idempotency_key_tx(tx, &key)?.is_some() {
                info!(idempotency_key = %key, "sl/tp trigger already recorded, no-op");
                return Ok(position.clone());
            }

            let realized_pnl = execution_tracker::close_at_price(
                tx,
                &mut position,
                trigger_price,
                execution_type,
                &format!("trigger-{}", key),
                commission_rate,
                Decimal::ZERO,
            )?;

            let payload = match kind {
                TriggerKind::StopLoss => EventPayload::StopLossTriggered {
                    trigger_price,
                    realized_pnl,
                },
                TriggerKind::TakeProfit => EventPayload::TakeProfitTriggered {
                    trigger_price,
                    realized_pnl,
                },
            };
            let event = event_store::new_event(
                &position.position_id,
                Some(PositionStatus::Open),
                Some(PositionStatus::Closed),
                payload,
                Some(key.clone()),
            );
            event_store::append(tx, event)?;

            crate::state_machine::transition(tx, &mut position, PositionStatus::Closed)?;

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

            Ok(position.clone())
        })
        .await?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::str::FromStr;

    fn buy_position(sl: &str, tp: &str) -> Position {
        Position {
            position_id: "pos-1".into(),
            execution_trade_id: "sig-1".into(),
            account_id: "acct-1".into(),
            pair: "BTC-USD".into(),
            side: Side::Buy,
            size: Decimal::from_str("0.1").unwrap(),
            avg_entry_price: Decimal::from_str("2000.00").unwrap(),
            leverage: 10,
            margin_used: Decimal::from_str("200.00").unwrap(),
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            accrued_unrealized_commission: Decimal::ZERO,
            stop_loss: Some(Decimal::from_str(sl).unwrap()),
            take_profit: Some(Decimal::from_str(tp).unwrap()),
            status: PositionStatus::Open,
            created_at: Utc::now(),
            opened_at: Some(Utc::now()),
            closed_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn buy_sl_triggers_below_or_equal() {
        let p = buy_position("1995", "2010");
        assert_eq!(
            check_trigger(&p, Decimal::from_str("1995").unwrap()),
            Some(TriggerKind::StopLoss)
        );
        assert_eq!(check_trigger(&p, Decimal::from_str("2000").unwrap()), None);
    }

    #[test]
    fn buy_tp_triggers_above_or_equal() {
        let p = buy_position("1995", "2010");
        assert_eq!(
            check_trigger(&p, Decimal::from_str("2010.01").unwrap()),
            Some(TriggerKind::TakeProfit)
        );
    }

    #[test]
    fn sell_directionality_is_inverse_of_buy() {
        let mut p = buy_position("1995", "2010");
        p.side = Side::Sell;
        p.stop_loss = Some(Decimal::from_str("2010").unwrap());
        p.take_profit = Some(Decimal::from_str("1995").unwrap());

        assert_eq!(
            check_trigger(&p, Decimal::from_str("2010").unwrap()),
            Some(TriggerKind::StopLoss)
        );
        assert_eq!(
            check_trigger(&p, Decimal::from_str("1995").unwrap()),
            Some(TriggerKind::TakeProfit)
        );
    }

    #[test]
    fn idempotency_key_format_matches_spec() {
        assert_eq!(idempotency_key("pos-1", 1700000000000), "close_pos-1_1700000000000");
    }
}
