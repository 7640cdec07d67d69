//! Engine Facade
//! Mission: Composition root and public API. Wraps every core call with a
//! configured timeout and tracks it in the operation registry.

use crate::config::EngineConfig;
use crate::domain::{
    AccountBalance, FillData, Position, PositionStatus, PriceTick, TradeSignal,
};
use crate::error::{EngineError, EngineResult};
use crate::integrity::IntegrityReport;
use crate::liquidation::LiquidationReport;
use crate::ops::{OperationProgress, OperationRegistry};
use crate::persistence::PersistenceGateway;
use crate::pnl::PositionMetrics;
use crate::risk_ledger::MarginStatus;
use crate::sltp_monitor::SltpMonitor;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub open_positions: usize,
    pub pending_positions: usize,
    pub closed_positions: usize,
    pub liquidated_positions: usize,
    pub timeouts_observed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub positions: Vec<Position>,
    pub balances: Vec<AccountBalance>,
}

/// The composition root: all components are constructed and wired here, owning
/// the persistence gateway as an immutable handle and the SL/TP watch set and
/// monitoring ticker as mutex-guarded shared state.
pub struct Engine {
    gateway: Arc<dyn PersistenceGateway>,
    config: EngineConfig,
    sltp: Arc<SltpMonitor>,
    ops: OperationRegistry,
    monitor_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: EngineConfig) -> Self {
        let ops = OperationRegistry::new(config.progress_tracking_enabled);
        Self {
            gateway,
            config,
            sltp: Arc::new(SltpMonitor::new()),
            ops,
            monitor_task: AsyncMutex::new(None),
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms)
    }
    fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.config.database_timeout_ms)
    }
    fn integrity_timeout(&self) -> Duration {
        Duration::from_millis(self.config.integrity_check_timeout_ms)
    }
    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.config.recovery_timeout_ms)
    }

    /// Rehydrates the SL/TP watch list, starts the monitoring tick, and runs an
    /// integrity probe. Warnings do not fail startup; errors are logged and surfaced.
    pub async fn initialize(&self) -> EngineResult<()> {
        self.ops
            .run("initialize", self.recovery_timeout(), async {
                self.sltp.rehydrate(&self.gateway).await?;

                if let Ok(report) = crate::integrity::run_full_audit(&self.gateway).await {
                    if !report.is_valid {
                        warn!("startup integrity probe reported violations; continuing");
                    }
                }

                self.start_margin_monitoring_inner().await;
                info!("engine initialized");
                Ok(())
            })
            .await
    }

    async fn start_margin_monitoring_inner(&self) {
        let gateway = self.gateway.clone();
        let config = self.config.clone();
        let interval = Duration::from_millis(config.monitoring_interval_ms);
        let sltp = self.sltp.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sltp.rehydrate(&gateway).await {
                    warn!(error = %e, "sltp rehydrate failed on tick");
                }
                if let Ok(balances) = gateway.all_account_balances().await {
                    for balance in balances {
                        if let Err(e) = crate::liquidation::liquidate_account(
                            &gateway,
                            &config,
                            &balance.account_id,
                        )
                        .await
                        {
                            warn!(account_id = %balance.account_id, error = %e, "liquidation sweep failed");
                        }
                    }
                }
            }
        });

        let mut guard = self.monitor_task.lock().await;
        *guard = Some(handle);
    }

    pub async fn start_sltp_monitoring(&self) -> EngineResult<()> {
        self.sltp.rehydrate(&self.gateway).await
    }

    /// Stops the monitoring tick and awaits in-flight transactions to a bounded
    /// deadline. Cancels queued paper-trading executions (none outstanding once
    /// the tick is stopped, since all writes are synchronous within a transaction).
    pub async fn shutdown(&self) -> EngineResult<()> {
        let handle = {
            let mut guard = self.monitor_task.lock().await;
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        info!("engine shut down");
        Ok(())
    }

    pub async fn create_position(&self, signal: TradeSignal) -> EngineResult<Position> {
        let gateway = self.gateway.clone();
        let max_leverage = self.config.max_leverage;
        let policy = self.config.leverage_policy;
        self.ops
            .run("create_position", self.op_timeout(), async move {
                let leverage = crate::risk_ledger::enforce_leverage(signal.leverage, max_leverage, policy)?;
                let mut signal = signal;
                signal.leverage = leverage;
                let margin_required = signal.margin_required;
                let account_id = signal.account_id.clone();

                let position = gateway
                    .transaction(move |tx| {
                        let position = crate::state_machine::create_position(tx, &signal)?;
                        crate::risk_ledger::reserve_margin(
                            tx,
                            &account_id,
                            margin_required,
                            &position.position_id,
                        )?;
                        Ok(position)
                    })
                    .await?;

                Ok(position)
            })
            .await
    }

    pub async fn process_partial_fill(
        &self,
        position_id: &str,
        fill: FillData,
        is_entry: bool,
    ) -> EngineResult<Position> {
        let gateway = self.gateway.clone();
        let sltp = self.sltp.clone();
        let commission_rate = self.config.commission_rate;
        let position_id = position_id.to_string();

        self.ops
            .run("process_partial_fill", self.op_timeout(), async move {
                let mut position = gateway
                    .find_position(&position_id)
                    .await?
                    .ok_or_else(|| EngineError::PositionNotFound(position_id.clone()))?;

                let outcome = gateway
                    .transaction(move |tx| {
                        crate::execution_tracker::process_partial_fill(
                            tx,
                            &mut position,
                            &fill,
                            is_entry,
                            commission_rate,
                        )
                    })
                    .await?;

                if outcome.just_opened {
                    sltp.arm(&outcome.position.pair, &outcome.position.position_id).await;
                }
                Ok(outcome.position)
            })
            .await
    }

    pub async fn process_full_fill(&self, position_id: &str, fill: FillData, is_entry: bool) -> EngineResult<Position> {
        let gateway = self.gateway.clone();
        let sltp = self.sltp.clone();
        let commission_rate = self.config.commission_rate;
        let position_id = position_id.to_string();

        self.ops
            .run("process_full_fill", self.op_timeout(), async move {
                let mut position = gateway
                    .find_position(&position_id)
                    .await?
                    .ok_or_else(|| EngineError::PositionNotFound(position_id.clone()))?;

                let outcome = gateway
                    .transaction(move |tx| {
                        crate::execution_tracker::process_full_fill(
                            tx,
                            &mut position,
                            &fill,
                            is_entry,
                            commission_rate,
                        )
                    })
                    .await?;

                if outcome.just_opened {
                    sltp.arm(&outcome.position.pair, &outcome.position.position_id).await;
                }
                if outcome.just_closed {
                    sltp.disarm(&outcome.position.pair, &outcome.position.position_id).await;
                }
                Ok(outcome.position)
            })
            .await
    }

    pub async fn update_position_pnl(&self, position_id: &str, market_price: Decimal) -> EngineResult<Position> {
        let gateway = self.gateway.clone();
        let position_id = position_id.to_string();
        self.ops
            .run("update_position_pnl", self.db_timeout(), async move {
                let mut position = gateway
                    .find_position(&position_id)
                    .await?
                    .ok_or_else(|| EngineError::PositionNotFound(position_id.clone()))?;
                gateway
                    .transaction(move |tx| crate::pnl::update_position_pnl(tx, &mut position, market_price))
                    .await?;
                gateway
                    .find_position(&position_id)
                    .await?
                    .ok_or_else(|| EngineError::PositionNotFound(position_id.clone()))
            })
            .await
    }

    pub async fn get_position_metrics(&self, position_id: &str) -> EngineResult<PositionMetrics> {
        let position = self.get_position(position_id).await?;
        Ok(crate::pnl::get_position_metrics(&position))
    }

    /// Routes a price tick to every monitored position on the symbol; updates
    /// unrealized P&L and fires SL/TP triggers as applicable.
    pub async fn update_market_price(&self, tick: PriceTick) -> EngineResult<Vec<Position>> {
        let gateway = self.gateway.clone();
        let sltp = self.sltp.clone();
        let config = self.config.clone();
        self.ops
            .run("update_market_price", self.op_timeout(), async move {
                let watched = sltp.watched(&tick.symbol).await;
                let mut touched = Vec::new();
                let trigger_millis = tick.timestamp.timestamp_millis();

                for position_id in watched {
                    let Some(position) = gateway.find_position(&position_id).await? else {
                        continue;
                    };
                    if position.status != PositionStatus::Open {
                        continue;
                    }

                    if let Some(kind) = crate::sltp_monitor::check_trigger(&position, tick.price) {
                        let closed = crate::sltp_monitor::execute_trigger(
                            &gateway,
                            &config,
                            position,
                            kind,
                            tick.price,
                            trigger_millis,
                        )
                        .await?;
                        sltp.disarm(&tick.symbol, &closed.position_id).await;
                        touched.push(closed);
                    } else {
                        let mut position = position;
                        gateway
                            .transaction(move |tx| {
                                crate::pnl::update_position_pnl(tx, &mut position, tick.price)?;
                                Ok(position)
                            })
                            .await
                            .map(|p| touched.push(p))
                            .ok();
                    }
                }

                Ok(touched)
            })
            .await
    }

    pub async fn check_margin_requirements(&self, account_id: &str) -> EngineResult<MarginStatus> {
        let gateway = self.gateway.clone();
        let margin_call = self.config.margin_call_level;
        let liquidation = self.config.liquidation_level;
        let account_id = account_id.to_string();
        self.ops
            .run("check_margin_requirements", self.db_timeout(), async move {
                gateway
                    .transaction(move |tx| {
                        crate::risk_ledger::check_margin_requirements(tx, &account_id, margin_call, liquidation)
                    })
                    .await
            })
            .await
    }

    pub async fn trigger_liquidation(&self, account_id: &str) -> EngineResult<LiquidationReport> {
        let gateway = self.gateway.clone();
        let config = self.config.clone();
        let account_id = account_id.to_string();
        self.ops
            .run("trigger_liquidation", self.op_timeout(), async move {
                crate::liquidation::liquidate_account(&gateway, &config, &account_id).await
            })
            .await
    }

    pub async fn start_margin_monitoring(&self) -> EngineResult<()> {
        self.start_margin_monitoring_inner().await;
        Ok(())
    }

    pub async fn stop_margin_monitoring(&self) -> EngineResult<()> {
        let handle = {
            let mut guard = self.monitor_task.lock().await;
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    pub async fn perform_integrity_check(&self) -> EngineResult<IntegrityReport> {
        let gateway = self.gateway.clone();
        self.ops
            .run("perform_integrity_check", self.integrity_timeout(), async move {
                crate::integrity::run_full_audit(&gateway).await
            })
            .await
    }

    /// Re-derives every position's state from its event log alone and reports
    /// whether the persisted state agrees — the recovery path invoked after a crash.
    pub async fn recover_system_state(&self) -> EngineResult<IntegrityReport> {
        let gateway = self.gateway.clone();
        self.ops
            .run("recover_system_state", self.recovery_timeout(), async move {
                self.sltp.rehydrate(&gateway).await?;
                crate::integrity::run_full_audit(&gateway).await
            })
            .await
    }

    pub async fn get_position(&self, position_id: &str) -> EngineResult<Position> {
        self.gateway
            .find_position(position_id)
            .await?
            .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))
    }

    pub async fn get_positions_by_status(&self, status: PositionStatus) -> EngineResult<Vec<Position>> {
        self.gateway.find_positions_by_status(status).await
    }

    pub async fn get_positions_by_account(&self, account_id: &str) -> EngineResult<Vec<Position>> {
        self.gateway.find_positions_by_account(account_id).await
    }

    pub async fn get_open_positions_with_sltp(&self) -> EngineResult<Vec<Position>> {
        self.gateway.find_open_positions_with_sltp().await
    }

    pub async fn get_system_state(&self) -> EngineResult<SystemState> {
        let positions = self.gateway.find_positions_by_status(PositionStatus::Open).await?;
        let balances = self.gateway.all_account_balances().await?;
        Ok(SystemState { positions, balances })
    }

    pub async fn get_engine_statistics(&self) -> EngineResult<EngineStatistics> {
        let open = self.gateway.find_positions_by_status(PositionStatus::Open).await?.len();
        let pending = self.gateway.find_positions_by_status(PositionStatus::Pending).await?.len();
        let closed = self.gateway.find_positions_by_status(PositionStatus::Closed).await?.len();
        let liquidated = self.gateway.find_positions_by_status(PositionStatus::Liquidated).await?.len();
        Ok(EngineStatistics {
            open_positions: open,
            pending_positions: pending,
            closed_positions: closed,
            liquidated_positions: liquidated,
            timeouts_observed: self.ops.timeout_count().await,
        })
    }

    /// Deterministic-processing check (invariant 11): replays a position's event
    /// log `n` times and asserts bit-identical reconstruction.
    pub async fn validate_deterministic_processing(&self, position_id: &str, n: usize) -> EngineResult<bool> {
        crate::integrity::deterministic_replay_check(&self.gateway, position_id, n).await
    }

    pub async fn create_system_checkpoint(&self) -> EngineResult<SystemState> {
        self.get_system_state().await
    }

    pub async fn get_operation_progress(&self, operation_id: &str) -> Option<OperationProgress> {
        self.ops.progress(operation_id).await
    }

    pub async fn cancel_operation(&self, operation_id: &str) -> bool {
        self.ops.cancel(operation_id).await
    }

    pub async fn get_timeout_statistics(&self) -> u64 {
        self.ops.timeout_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LeveragePolicy, PaperTradingConfig};
    use crate::persistence::sqlite;
    use std::str::FromStr;

    fn test_config() -> EngineConfig {
        EngineConfig {
            database_path: ":memory:".into(),
            bind_addr: "127.0.0.1:0".into(),
            jwt_secret: "test-secret".into(),
            log_level: "info".into(),
            max_leverage: 100,
            leverage_policy: LeveragePolicy::Reject,
            margin_call_level: Decimal::from_str("0.5").unwrap(),
            liquidation_level: Decimal::from_str("0.2").unwrap(),
            commission_rate: Decimal::ZERO,
            is_paper_mode: true,
            paper_trading: PaperTradingConfig {
                slippage_enabled: false,
                max_slippage_bps: 0,
                latency_ms: 0,
                rejection_rate: 0.0,
            },
            operation_timeout_ms: 5_000,
            database_timeout_ms: 5_000,
            integrity_check_timeout_ms: 5_000,
            recovery_timeout_ms: 5_000,
            monitoring_interval_ms: 60_000,
            max_slippage_percent: Decimal::from_str("5.0").unwrap(),
            liquidation_fee_percent: Decimal::ZERO,
            progress_tracking_enabled: true,
        }
    }

    async fn seeded_gateway(account_id: &str, balance: &str) -> crate::persistence::SqliteGateway {
        let gw = crate::persistence::SqliteGateway::open_in_memory().unwrap();
        let balance = Decimal::from_str(balance).unwrap();
        let account_id = account_id.to_string();
        gw.transaction(move |tx| {
            let account = AccountBalance {
                account_id,
                equity: balance,
                balance,
                margin_used: Decimal::ZERO,
                free_margin: balance,
                leverage: 1,
                is_paper: true,
            };
            sqlite::upsert_account_balance(tx, &account)
        })
        .await
        .unwrap();
        gw
    }

    fn signal() -> TradeSignal {
        TradeSignal {
            id: "sig-1".into(),
            account_id: "acct-1".into(),
            pair: "BTC-USD".into(),
            direction: crate::domain::Side::Buy,
            entry_price: Decimal::from_str("2000.00").unwrap(),
            position_size: Decimal::from_str("0.1").unwrap(),
            leverage: 10,
            margin_required: Decimal::from_str("200.00").unwrap(),
            stop_loss: Some(Decimal::from_str("1990.00").unwrap()),
            take_profit: Some(Decimal::from_str("2010.00").unwrap()),
        }
    }

    #[tokio::test]
    async fn create_and_fill_opens_a_position() {
        let gw = seeded_gateway("acct-1", "10000.00").await;
        let engine = Engine::new(Arc::new(gw), test_config());
        engine.initialize().await.unwrap();

        let position = engine.create_position(signal()).await.unwrap();
        assert_eq!(position.status, PositionStatus::Pending);

        let fill = crate::domain::FillData {
            order_id: "o1".into(),
            price: Decimal::from_str("2000.00").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        let opened = engine
            .process_full_fill(&position.position_id, fill, true)
            .await
            .unwrap();

        assert_eq!(opened.status, PositionStatus::Open);
        assert_eq!(opened.size, Decimal::from_str("0.1").unwrap());
    }

    #[tokio::test]
    async fn take_profit_trigger_closes_position_and_credits_balance() {
        let gw = Arc::new(seeded_gateway("acct-1", "10000.00").await);
        let engine = Engine::new(gw.clone(), test_config());
        engine.initialize().await.unwrap();

        let position = engine.create_position(signal()).await.unwrap();
        let fill = crate::domain::FillData {
            order_id: "o1".into(),
            price: Decimal::from_str("2000.00").unwrap(),
            size: Decimal::from_str("0.1").unwrap(),
            executed_at: chrono::Utc::now(),
        };
        engine
            .process_full_fill(&position.position_id, fill, true)
            .await
            .unwrap();

        engine.start_sltp_monitoring().await.unwrap();

        let tick = PriceTick {
            symbol: "BTC-USD".into(),
            price: Decimal::from_str("2015.00").unwrap(),
            timestamp: chrono::Utc::now(),
        };
        let touched = engine.update_market_price(tick).await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].status, PositionStatus::Closed);

        let balance = gw.find_account_balance("acct-1").await.unwrap().unwrap();
        assert!(balance.balance > Decimal::from_str("10000.00").unwrap());
    }

    #[tokio::test]
    async fn recovery_replays_positions_consistently_with_persisted_state() {
        let gw = Arc::new(seeded_gateway("acct-1", "10000.00").await);
        let engine = Engine::new(gw.clone(), test_config());
        engine.initialize().await.unwrap();

        for i in 0..3 {
            let mut sig = signal();
            sig.id = format!("sig-{i}");
            engine.create_position(sig).await.unwrap();
        }

        let report = engine.recover_system_state().await.unwrap();
        assert!(report.is_valid, "integrity report: {:?}", report);
    }
}
