//! Account Ledger Model
//! Mission: The per-account balance head and its append-only delta log

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceReason {
    #[serde(rename = "PARTIAL_EXIT")]
    PartialExit,
    #[serde(rename = "POSITION_CLOSED")]
    PositionClosed,
    #[serde(rename = "LIQUIDATION")]
    Liquidation,
    #[serde(rename = "MARGIN_RESERVE")]
    MarginReserve,
    #[serde(rename = "MARGIN_RELEASE")]
    MarginRelease,
    #[serde(rename = "FEE")]
    Fee,
}

impl BalanceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceReason::PartialExit => "PARTIAL_EXIT",
            BalanceReason::PositionClosed => "POSITION_CLOSED",
            BalanceReason::Liquidation => "LIQUIDATION",
            BalanceReason::MarginReserve => "MARGIN_RESERVE",
            BalanceReason::MarginRelease => "MARGIN_RELEASE",
            BalanceReason::Fee => "FEE",
        }
    }
}

/// Per-account ledger head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: String,
    pub equity: Decimal,
    pub balance: Decimal,
    pub margin_used: Decimal,
    pub free_margin: Decimal,
    pub leverage: u32,
    pub is_paper: bool,
}

impl AccountBalance {
    pub fn recompute_free_margin(&mut self) {
        self.free_margin = self.balance - self.margin_used;
    }
}

/// Append-only ledger delta. `balance_after = balance_before + amount` always.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalanceEvent {
    pub id: String,
    pub account_id: String,
    pub balance_before: Decimal,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub reason: BalanceReason,
    pub position_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
