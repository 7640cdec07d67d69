//! Position Event Model
//! Mission: Tagged-union audit records that are the sole source of truth for position state

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::{PositionStatus, Side};

/// Strongly typed per-event-type payload. Stored as opaque serialized JSON;
/// never pattern-matched before deserializing back to this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventPayload {
    #[serde(rename = "POSITION_CREATED")]
    PositionCreated {
        account_id: String,
        pair: String,
        execution_trade_id: String,
        side: Side,
        entry_price: Decimal,
        leverage: u32,
        margin_used: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
    #[serde(rename = "ORDER_FILLED")]
    OrderFilled {
        order_id: String,
        price: Decimal,
        size: Decimal,
    },
    #[serde(rename = "PARTIAL_FILL")]
    PartialFill {
        order_id: String,
        price: Decimal,
        size: Decimal,
        is_entry: bool,
        new_size: Decimal,
        new_avg_entry_price: Decimal,
        realized_pnl_delta: Decimal,
    },
    #[serde(rename = "POSITION_OPENED")]
    PositionOpened { avg_entry_price: Decimal },
    #[serde(rename = "POSITION_UPDATED")]
    PositionUpdated {
        market_price: Decimal,
        unrealized_pnl: Decimal,
    },
    #[serde(rename = "STOP_LOSS_TRIGGERED")]
    StopLossTriggered {
        trigger_price: Decimal,
        realized_pnl: Decimal,
    },
    #[serde(rename = "TAKE_PROFIT_TRIGGERED")]
    TakeProfitTriggered {
        trigger_price: Decimal,
        realized_pnl: Decimal,
    },
    #[serde(rename = "POSITION_CLOSED")]
    PositionClosed {
        exit_price: Decimal,
        realized_pnl: Decimal,
    },
    #[serde(rename = "POSITION_LIQUIDATED")]
    PositionLiquidated {
        exit_price: Decimal,
        realized_pnl: Decimal,
        liquidation_fee: Decimal,
    },
    #[serde(rename = "POSITION_ARCHIVED")]
    PositionArchived,
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::PositionCreated { .. } => "POSITION_CREATED",
            EventPayload::OrderFilled { .. } => "ORDER_FILLED",
            EventPayload::PartialFill { .. } => "PARTIAL_FILL",
            EventPayload::PositionOpened { .. } => "POSITION_OPENED",
            EventPayload::PositionUpdated { .. } => "POSITION_UPDATED",
            EventPayload::StopLossTriggered { .. } => "STOP_LOSS_TRIGGERED",
            EventPayload::TakeProfitTriggered { .. } => "TAKE_PROFIT_TRIGGERED",
            EventPayload::PositionClosed { .. } => "POSITION_CLOSED",
            EventPayload::PositionLiquidated { .. } => "POSITION_LIQUIDATED",
            EventPayload::PositionArchived => "POSITION_ARCHIVED",
        }
    }
}

/// Immutable audit record. Forms a totally ordered, per-position append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub id: String,
    pub position_id: String,
    pub previous_status: Option<PositionStatus>,
    pub new_status: Option<PositionStatus>,
    pub payload: EventPayload,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PositionEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
