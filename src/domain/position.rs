//! Position Data Model
//! Mission: Define the trade lot that the engine owns for its entire lifecycle

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// +1 for BUY, -1 for SELL — multiplies price delta to get signed P&L
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "LIQUIDATED")]
    Liquidated,
    #[serde(rename = "ARCHIVED")]
    Archived,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Liquidated => "LIQUIDATED",
            PositionStatus::Archived => "ARCHIVED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PositionStatus::Pending),
            "OPEN" => Some(PositionStatus::Open),
            "CLOSED" => Some(PositionStatus::Closed),
            "LIQUIDATED" => Some(PositionStatus::Liquidated),
            "ARCHIVED" => Some(PositionStatus::Archived),
            _ => None,
        }
    }

    /// Whether `to` is a legal transition target from `self`, per the state table.
    pub fn can_transition_to(&self, to: PositionStatus) -> bool {
        matches!(
            (self, to),
            (PositionStatus::Pending, PositionStatus::Open)
                | (PositionStatus::Pending, PositionStatus::Closed)
                | (PositionStatus::Open, PositionStatus::Closed)
                | (PositionStatus::Open, PositionStatus::Liquidated)
                | (PositionStatus::Closed, PositionStatus::Archived)
                | (PositionStatus::Liquidated, PositionStatus::Archived)
        )
    }
}

/// A trade lot, the unit of engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub execution_trade_id: String,
    pub account_id: String,
    pub pair: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub leverage: u32,
    pub margin_used: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub accrued_unrealized_commission: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Net unrealized + realized P&L as fraction of reserved margin.
    pub fn return_on_margin(&self) -> Decimal {
        if self.margin_used.is_zero() {
            return Decimal::ZERO;
        }
        (self.unrealized_pnl + self.realized_pnl) / self.margin_used
    }
}
