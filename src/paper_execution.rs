//! Paper Execution Adapter
//! Mission: Simulate fills for the engine's paper-trading mode — latency, slippage,
//! partial fills, and rejection — without touching a real venue.

use crate::config::PaperTradingConfig;
use crate::domain::{FillData, Side};
use crate::error::{EngineError, EngineResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// An intent to fill: the side, requested price, and requested size of an order
/// about to be routed through paper execution.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub order_id: String,
    pub side: Side,
    pub requested_price: Decimal,
    pub requested_size: Decimal,
}

#[async_trait::async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn simulate_fill(&self, intent: OrderIntent) -> EngineResult<FillData>;
}

/// Simulates a fill against `PaperTradingConfig`: adverse slippage proportional to
/// `max_slippage_bps`, a fixed latency, and a uniform rejection probability. There
/// is no partial-fill simulation here — the engine's own partial-fill path is
/// driven by the strategy engine sending multiple `FillData` records, not by this
/// adapter fabricating them.
pub struct PaperExecutionAdapter {
    config: PaperTradingConfig,
}

impl PaperExecutionAdapter {
    pub fn new(config: PaperTradingConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    async fn simulate_fill(&self, intent: OrderIntent) -> EngineResult<FillData> {
        if self.config.latency_ms > 0 {
            sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let mut rng = StdRng::from_entropy();

        if self.config.rejection_rate > 0.0 && rng.gen::<f64>() < self.config.rejection_rate {
            warn!(order_id = %intent.order_id, "paper order rejected (simulated)");
            return Err(EngineError::Internal(format!(
                "paper order {} rejected (simulated)",
                intent.order_id
            )));
        }

        let filled_price = if self.config.slippage_enabled {
            let max_bps = Decimal::from(self.config.max_slippage_bps);
            let bps = Decimal::from(rng.gen_range(0..=self.config.max_slippage_bps));
            let multiplier = bps / Decimal::from(10_000);
            debug!(order_id = %intent.order_id, slippage_bps = %bps, max_bps = %max_bps, "paper slippage applied");
            match intent.side {
                Side::Buy => intent.requested_price * (Decimal::ONE + multiplier),
                Side::Sell => intent.requested_price * (Decimal::ONE - multiplier),
            }
        } else {
            intent.requested_price
        };

        Ok(FillData {
            order_id: intent.order_id,
            price: filled_price,
            size: intent.requested_size,
            executed_at: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn config(slippage_enabled: bool, rejection_rate: f64) -> PaperTradingConfig {
        PaperTradingConfig {
            slippage_enabled,
            max_slippage_bps: 10,
            latency_ms: 0,
            rejection_rate,
        }
    }

    #[tokio::test]
    async fn buy_slippage_is_adverse() {
        let adapter = PaperExecutionAdapter::new(config(true, 0.0));
        let fill = adapter
            .simulate_fill(OrderIntent {
                order_id: "o1".into(),
                side: Side::Buy,
                requested_price: Decimal::from_str("2000.00").unwrap(),
                requested_size: Decimal::from_str("0.1").unwrap(),
            })
            .await
            .unwrap();
        assert!(fill.price >= Decimal::from_str("2000.00").unwrap());
    }

    #[tokio::test]
    async fn no_slippage_returns_requested_price() {
        let adapter = PaperExecutionAdapter::new(config(false, 0.0));
        let fill = adapter
            .simulate_fill(OrderIntent {
                order_id: "o1".into(),
                side: Side::Sell,
                requested_price: Decimal::from_str("2000.00").unwrap(),
                requested_size: Decimal::from_str("0.1").unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(fill.price, Decimal::from_str("2000.00").unwrap());
    }

    #[tokio::test]
    async fn full_rejection_rate_always_errors() {
        let adapter = PaperExecutionAdapter::new(config(false, 1.0));
        let result = adapter
            .simulate_fill(OrderIntent {
                order_id: "o1".into(),
                side: Side::Buy,
                requested_price: Decimal::from_str("2000.00").unwrap(),
                requested_size: Decimal::from_str("0.1").unwrap(),
            })
            .await;
        assert!(result.is_err());
    }
}
