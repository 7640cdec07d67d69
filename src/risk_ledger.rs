//! Risk Ledger
//! Mission: Own the account balance head and its append-only delta log; reserve and
//! release margin against open positions

use crate::config::LeveragePolicy;
use crate::domain::{AccountBalance, AccountBalanceEvent, BalanceReason};
use crate::error::{EngineError, EngineResult};
use crate::persistence::sqlite;
use chrono::Utc;
use rust_decimal::Decimal;
use rusqlite::Transaction;
use tracing::{info, warn};
use uuid::Uuid;

/// Margin check result for a single account (§4.6).
#[derive(Debug, Clone)]
pub struct MarginStatus {
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub margin_level: Decimal,
    pub margin_call_triggered: bool,
    pub liquidation_triggered: bool,
}

fn load_or_default(tx: &Transaction<'_>, account_id: &str) -> EngineResult<AccountBalance> {
    if let Some(existing) = sqlite::find_account_balance_tx(tx, account_id)? {
        return Ok(existing);
    }
    Ok(AccountBalance {
        account_id: account_id.to_string(),
        equity: Decimal::ZERO,
        balance: Decimal::ZERO,
        margin_used: Decimal::ZERO,
        free_margin: Decimal::ZERO,
        leverage: 1,
        is_paper: true,
    })
}

/// Appends a balance event respecting the balance equation, then updates the
/// ledger head. `balance_after = balance_before + amount` is enforced here, not
/// merely asserted downstream.
fn append_balance_event(
    tx: &Transaction<'_>,
    account: &mut AccountBalance,
    amount: Decimal,
    reason: BalanceReason,
    position_id: Option<String>,
) -> EngineResult<()> {
    let balance_before = account.balance;
    let balance_after = balance_before + amount;

    let event = AccountBalanceEvent {
        id: Uuid::new_v4().to_string(),
        account_id: account.account_id.clone(),
        balance_before,
        amount,
        balance_after,
        reason,
        position_id,
        created_at: Utc::now(),
    };
    sqlite::insert_balance_event(tx, &event)?;

    account.balance = balance_after;
    account.equity = balance_after;
    account.recompute_free_margin();
    sqlite::upsert_account_balance(tx, account)?;

    Ok(())
}

/// Checks `free_margin >= amount` and, if so, reserves it against `position_id`.
/// Fails with `InsufficientMargin` otherwise — the position must not be created.
pub fn reserve_margin(
    tx: &Transaction<'_>,
    account_id: &str,
    amount: Decimal,
    position_id: &str,
) -> EngineResult<()> {
    let mut account = load_or_default(tx, account_id)?;

    if account.free_margin < amount {
        warn!(account_id = %account_id, requested = %amount, free = %account.free_margin, "insufficient margin");
        return Err(EngineError::InsufficientMargin {
            account_id: account_id.to_string(),
            requested: amount.to_string(),
            free: account.free_margin.to_string(),
        });
    }

    account.margin_used += amount;
    account.recompute_free_margin();
    sqlite::upsert_account_balance(tx, &account)?;

    append_balance_event(
        tx,
        &mut account,
        Decimal::ZERO,
        BalanceReason::MarginReserve,
        Some(position_id.to_string()),
    )?;

    info!(account_id = %account_id, position_id = %position_id, amount = %amount, "margin reserved");
    Ok(())
}

/// Releases previously reserved margin — the symmetric counterpart to `reserve_margin`.
pub fn release_margin(
    tx: &Transaction<'_>,
    account_id: &str,
    amount: Decimal,
    position_id: &str,
) -> EngineResult<()> {
    let mut account = load_or_default(tx, account_id)?;

    account.margin_used = (account.margin_used - amount).max(Decimal::ZERO);
    account.recompute_free_margin();
    sqlite::upsert_account_balance(tx, &account)?;

    append_balance_event(
        tx,
        &mut account,
        Decimal::ZERO,
        BalanceReason::MarginRelease,
        Some(position_id.to_string()),
    )?;

    info!(account_id = %account_id, position_id = %position_id, amount = %amount, "margin released");
    Ok(())
}

/// Generic ledger credit/debit respecting the balance equation.
pub fn update_account_balance(
    tx: &Transaction<'_>,
    account_id: &str,
    amount: Decimal,
    reason: BalanceReason,
    position_id: Option<String>,
) -> EngineResult<()> {
    let mut account = load_or_default(tx, account_id)?;
    append_balance_event(tx, &mut account, amount, reason, position_id)
}

/// Settles a position closure: credits net realized P&L and releases its margin.
/// Always emits exactly one `AccountBalanceEvent`, even when `realized_pnl` is
/// zero (resolving the §9 open question — the source did not always emit one).
pub fn settle_closure(
    tx: &Transaction<'_>,
    account_id: &str,
    position_id: &str,
    realized_pnl: Decimal,
    margin_used: Decimal,
) -> EngineResult<()> {
    let mut account = load_or_default(tx, account_id)?;

    account.margin_used = (account.margin_used - margin_used).max(Decimal::ZERO);
    account.recompute_free_margin();
    sqlite::upsert_account_balance(tx, &account)?;

    append_balance_event(
        tx,
        &mut account,
        realized_pnl,
        BalanceReason::PositionClosed,
        Some(position_id.to_string()),
    )?;

    Ok(())
}

/// Returns the account's margin check, thresholds per configuration.
pub fn check_margin_requirements(
    tx: &Transaction<'_>,
    account_id: &str,
    margin_call_level: Decimal,
    liquidation_level: Decimal,
) -> EngineResult<MarginStatus> {
    let account = load_or_default(tx, account_id)?;

    let margin_level = if account.margin_used.is_zero() {
        Decimal::MAX
    } else {
        account.equity / account.margin_used
    };

    Ok(MarginStatus {
        equity: account.equity,
        margin_used: account.margin_used,
        margin_level,
        margin_call_triggered: margin_level <= margin_call_level,
        liquidation_triggered: margin_level <= liquidation_level,
    })
}

/// Leverage enforcement at position creation (§4.6): reject or cap, a
/// construction-time policy choice surfaced in configuration.
pub fn enforce_leverage(leverage: u32, max_leverage: u32, policy: LeveragePolicy) -> EngineResult<u32> {
    if leverage <= max_leverage {
        return Ok(leverage);
    }
    match policy {
        LeveragePolicy::Reject => Err(EngineError::InvalidTransition {
            position_id: String::new(),
            from: format!("leverage {}", leverage),
            to: format!("max {}", max_leverage),
        }),
        LeveragePolicy::Cap => Ok(max_leverage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PersistenceGateway, SqliteGateway};
    use std::str::FromStr;

    async fn seeded(balance: &str) -> SqliteGateway {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let balance = Decimal::from_str(balance).unwrap();
        gw.transaction(move |tx| {
            let mut account = AccountBalance {
                account_id: "acct-1".into(),
                equity: balance,
                balance,
                margin_used: Decimal::ZERO,
                free_margin: balance,
                leverage: 1,
                is_paper: true,
            };
            sqlite::upsert_account_balance(tx, &mut account)?;
            Ok::<_, EngineError>(())
        })
        .await
        .unwrap();
        gw
    }

    #[tokio::test]
    async fn reserve_margin_fails_when_insufficient() {
        let gw = seeded("100.00").await;
        let result = gw
            .transaction(|tx| reserve_margin(tx, "acct-1", Decimal::from_str("200.00").unwrap(), "pos-1"))
            .await;
        assert!(matches!(result, Err(EngineError::InsufficientMargin { .. })));
    }

    #[tokio::test]
    async fn reserve_then_release_restores_free_margin() {
        let gw = seeded("10000.00").await;
        let amount = Decimal::from_str("200.00").unwrap();
        gw.transaction(move |tx| reserve_margin(tx, "acct-1", amount, "pos-1"))
            .await
            .unwrap();
        let after_reserve = gw.find_account_balance("acct-1").await.unwrap().unwrap();
        assert_eq!(after_reserve.free_margin, Decimal::from_str("9800.00").unwrap());

        gw.transaction(move |tx| release_margin(tx, "acct-1", amount, "pos-1"))
            .await
            .unwrap();
        let after_release = gw.find_account_balance("acct-1").await.unwrap().unwrap();
        assert_eq!(after_release.free_margin, Decimal::from_str("10000.00").unwrap());
    }

    #[tokio::test]
    async fn balance_equation_holds_on_every_event() {
        let gw = seeded("10000.00").await;
        gw.transaction(|tx| {
            update_account_balance(
                tx,
                "acct-1",
                Decimal::from_str("1.00").unwrap(),
                BalanceReason::PositionClosed,
                Some("pos-1".into()),
            )
        })
        .await
        .unwrap();

        let events = gw.all_account_balance_events().await.unwrap();
        for e in events {
            assert_eq!(e.balance_before + e.amount, e.balance_after);
        }
    }

    #[test]
    fn leverage_cap_policy_caps_rather_than_rejects() {
        let result = enforce_leverage(150, 100, LeveragePolicy::Cap).unwrap();
        assert_eq!(result, 100);
    }

    #[test]
    fn leverage_reject_policy_errors_over_cap() {
        let result = enforce_leverage(150, 100, LeveragePolicy::Reject);
        assert!(result.is_err());
    }
}
