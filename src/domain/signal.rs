//! Inbound Collaborator Messages
//! Mission: The narrow interfaces the strategy engine and market data feed speak through

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// A trade intent from the (out-of-scope) strategy engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradeSignal {
    pub id: String,
    pub account_id: String,
    pub pair: String,
    pub direction: Side,
    pub entry_price: Decimal,
    pub position_size: Decimal,
    pub leverage: u32,
    pub margin_required: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// A market price update from the (out-of-scope) market data feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}
