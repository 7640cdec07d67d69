//! Integrity Service
//! Mission: On-demand audits of the balance equation, event coverage, and replay determinism

use crate::domain::{EventPayload, PositionStatus};
use crate::error::{EngineError, EngineResult};
use crate::event_store;
use crate::persistence::PersistenceGateway;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::error;

const EPSILON_MONEY: &str = "0.01";

fn epsilon() -> Decimal {
    Decimal::new(1, 2)
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub balance_equation_violations: Vec<String>,
    pub orphan_events: Vec<String>,
    pub positions_missing_required_events: Vec<String>,
    pub margin_reconciliation_mismatches: Vec<String>,
    pub replay_mismatches: Vec<String>,
}

impl IntegrityReport {
    fn empty() -> Self {
        Self {
            is_valid: true,
            balance_equation_violations: Vec::new(),
            orphan_events: Vec::new(),
            positions_missing_required_events: Vec::new(),
            margin_reconciliation_mismatches: Vec::new(),
            replay_mismatches: Vec::new(),
        }
    }

    fn finalize(mut self) -> Self {
        self.is_valid = self.balance_equation_violations.is_empty()
            && self.orphan_events.is_empty()
            && self.positions_missing_required_events.is_empty()
            && self.margin_reconciliation_mismatches.is_empty()
            && self.replay_mismatches.is_empty();
        self
    }
}

/// Runs every audit in §4.9 against the current persisted state.
pub async fn run_full_audit(gateway: &Arc<dyn PersistenceGateway>) -> EngineResult<IntegrityReport> {
    let mut report = IntegrityReport::empty();

    balance_equation_check(gateway, &mut report).await?;
    event_coverage_and_orphans(gateway, &mut report).await?;
    ledger_reconciliation(gateway, &mut report).await?;

    let report = report.finalize();
    if !report.is_valid {
        error!(epsilon = EPSILON_MONEY, "integrity audit found violations");
    }

    Ok(report)
}

async fn balance_equation_check(
    gateway: &Arc<dyn PersistenceGateway>,
    report: &mut IntegrityReport,
) -> EngineResult<()> {
    let events = gateway.all_account_balance_events().await?;
    let eps = epsilon();
    for e in events {
        let expected = e.balance_before + e.amount;
        if (expected - e.balance_after).abs() > eps {
            report.balance_equation_violations.push(e.id.clone());
        }
    }
    Ok(())
}

async fn event_coverage_and_orphans(
    gateway: &Arc<dyn PersistenceGateway>,
    report: &mut IntegrityReport,
) -> EngineResult<()> {
    let all_events = gateway.all_events().await?;
    let mut by_position: HashMap<String, Vec<_>> = HashMap::new();
    for e in &all_events {
        by_position.entry(e.position_id.clone()).or_default().push(e.clone());
    }

    let current_status: HashMap<String, PositionStatus> = {
        let mut map = HashMap::new();
        for status in [
            PositionStatus::Pending,
            PositionStatus::Open,
            PositionStatus::Closed,
            PositionStatus::Liquidated,
            PositionStatus::Archived,
        ] {
            for p in gateway.find_positions_by_status(status).await? {
                map.insert(p.position_id, status);
            }
        }
        map
    };
    let known_positions: HashSet<String> = current_status.keys().cloned().collect();

    for position_id in by_position.keys() {
        if !known_positions.contains(position_id) {
            report.orphan_events.push(position_id.clone());
        }
    }

    for position_id in &known_positions {
        let events = by_position.get(position_id).cloned().unwrap_or_default();
        let has_created = events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::PositionCreated { .. }));
        if !has_created {
            report.positions_missing_required_events.push(position_id.clone());
            continue;
        }

        let became_open = events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::PositionOpened { .. }));
        let ever_open_or_later = events.iter().any(|e| {
            matches!(
                e.new_status,
                Some(PositionStatus::Open)
                    | Some(PositionStatus::Closed)
                    | Some(PositionStatus::Liquidated)
                    | Some(PositionStatus::Archived)
            )
        });
        if ever_open_or_later && !became_open {
            report.positions_missing_required_events.push(position_id.clone());
            continue;
        }

        let is_terminally_closed = matches!(
            current_status.get(position_id),
            Some(PositionStatus::Closed) | Some(PositionStatus::Liquidated)
        );
        let has_terminal_closure_event = events.iter().any(|e| {
            matches!(
                e.payload,
                EventPayload::PositionClosed { .. }
                    | EventPayload::StopLossTriggered { .. }
                    | EventPayload::TakeProfitTriggered { .. }
                    | EventPayload::PositionLiquidated { .. }
            )
        });
        if is_terminally_closed && !has_terminal_closure_event {
            report.positions_missing_required_events.push(position_id.clone());
        }
    }

    Ok(())
}

async fn ledger_reconciliation(
    gateway: &Arc<dyn PersistenceGateway>,
    report: &mut IntegrityReport,
) -> EngineResult<()> {
    let balances = gateway.all_account_balances().await?;
    let eps = epsilon();

    for balance in balances {
        let open_positions = gateway.find_positions_by_account(&balance.account_id).await?;
        let sum_margin: Decimal = open_positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.margin_used)
            .sum();

        if (sum_margin - balance.margin_used).abs() > eps {
            report
                .margin_reconciliation_mismatches
                .push(balance.account_id.clone());
        }
    }

    Ok(())
}

/// Replays `position_id`'s events `n` times and asserts bit-identical
/// reconstruction — the deterministic-replay check.
pub async fn deterministic_replay_check(
    gateway: &Arc<dyn PersistenceGateway>,
    position_id: &str,
    n: usize,
) -> EngineResult<bool> {
    let events = gateway
        .list_events_by_position(position_id, crate::persistence::Order::Ascending)
        .await?;

    let first = event_store::replay(&events)?;
    for _ in 1..n {
        let next = event_store::replay(&events)?;
        match (&first, &next) {
            (Some(a), Some(b)) => {
                if a.size != b.size
                    || a.avg_entry_price != b.avg_entry_price
                    || a.realized_pnl != b.realized_pnl
                    || a.status != b.status
                {
                    return Ok(false);
                }
            }
            (None, None) => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Compares a position's live persisted state to its replayed state — used by
/// `recoverSystemState`'s post-recovery check.
pub async fn matches_replay(
    gateway: &Arc<dyn PersistenceGateway>,
    position_id: &str,
) -> EngineResult<bool> {
    let persisted = gateway
        .find_position(position_id)
        .await?
        .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;
    let events = gateway
        .list_events_by_position(position_id, crate::persistence::Order::Ascending)
        .await?;
    let replayed = event_store::replay(&events)?
        .ok_or_else(|| EngineError::IntegrityViolation(format!("no replay state for {}", position_id)))?;

    let eps = epsilon();
    Ok((persisted.size - replayed.size).abs() <= Decimal::new(1, 4)
        && (persisted.avg_entry_price - replayed.avg_entry_price).abs() <= Decimal::new(1, 4)
        && (persisted.realized_pnl - replayed.realized_pnl).abs() <= eps
        && persisted.status == replayed.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, TradeSignal};
    use crate::persistence::SqliteGateway;
    use std::str::FromStr;

    #[test]
    fn epsilon_is_one_cent() {
        assert_eq!(epsilon(), Decimal::new(1, 2));
    }

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
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn closed_position_missing_terminal_event_is_flagged() {
        let gw: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let sig = signal();
        let mut position = gw
            .transaction(move |tx| crate::state_machine::create_position(tx, &sig))
            .await
            .unwrap();

        let fill = crate::domain::FillData {
            order_id: "o1".into(),
            price: Decimal::from_str("2000.00").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        gw.transaction(move |tx| {
            crate::execution_tracker::process_partial_fill(tx, &mut position, &fill, true, Decimal::ZERO)
        })
        .await
        .unwrap();

        // Transition straight to CLOSED without going through execution_tracker
        // (which would append the terminal POSITION_CLOSED event) — simulates a
        // write that skipped the event-log half of the update.
        let mut position = gw.find_positions_by_status(PositionStatus::Open).await.unwrap().remove(0);
        gw.transaction(move |tx| crate::state_machine::transition(tx, &mut position, PositionStatus::Closed))
            .await
            .unwrap();

        let report = run_full_audit(&gw).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.positions_missing_required_events.len(), 1);
    }
}
