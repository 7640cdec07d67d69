//! Trade Execution Model
//! Mission: Record every fill against a position

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    #[serde(rename = "ENTRY")]
    Entry,
    #[serde(rename = "PARTIAL_EXIT")]
    PartialExit,
    #[serde(rename = "STOP_LOSS")]
    StopLoss,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    #[serde(rename = "LIQUIDATION")]
    Liquidation,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Entry => "ENTRY",
            ExecutionType::PartialExit => "PARTIAL_EXIT",
            ExecutionType::StopLoss => "STOP_LOSS",
            ExecutionType::TakeProfit => "TAKE_PROFIT",
            ExecutionType::Liquidation => "LIQUIDATION",
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, ExecutionType::Entry)
    }
}

/// A fill record — partial or full execution of an order against liquidity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecution {
    pub position_id: String,
    pub order_id: String,
    pub execution_type: ExecutionType,
    pub price: Decimal,
    pub size: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// Inbound fill notification from the broker/execution adapter (§6 FillData).
#[derive(Debug, Clone, Deserialize)]
pub struct FillData {
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub executed_at: DateTime<Utc>,
}
