//! Engine Configuration
//! Mission: Load every tunable the position lifecycle engine needs from the environment

use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::info;

/// How leverage above `max_leverage` is handled at position creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeveragePolicy {
    Reject,
    Cap,
}

impl LeveragePolicy {
    fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "cap" => LeveragePolicy::Cap,
            _ => LeveragePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaperTradingConfig {
    pub slippage_enabled: bool,
    pub max_slippage_bps: u32,
    pub latency_ms: u64,
    pub rejection_rate: f64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub log_level: String,

    pub max_leverage: u32,
    pub leverage_policy: LeveragePolicy,
    pub margin_call_level: Decimal,
    pub liquidation_level: Decimal,
    pub commission_rate: Decimal,

    pub is_paper_mode: bool,
    pub paper_trading: PaperTradingConfig,

    pub operation_timeout_ms: u64,
    pub database_timeout_ms: u64,
    pub integrity_check_timeout_ms: u64,
    pub recovery_timeout_ms: u64,

    pub monitoring_interval_ms: u64,
    pub max_slippage_percent: Decimal,
    pub liquidation_fee_percent: Decimal,

    pub progress_tracking_enabled: bool,
}

fn env_var(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).expect("default decimal literal is valid"))
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let config = Self {
            database_path: env_var("DATABASE_PATH", "./margin_engine.db"),
            bind_addr: env_var("BIND_ADDR", "0.0.0.0:8080"),
            jwt_secret: env_var("JWT_SECRET", "dev-secret-change-in-production"),
            log_level: env_var("LOG_LEVEL", "info"),

            max_leverage: env_parse("MAX_LEVERAGE", 100),
            leverage_policy: LeveragePolicy::from_env_str(&env_var("LEVERAGE_POLICY", "reject")),
            margin_call_level: env_decimal("MARGIN_CALL_LEVEL", "0.5"),
            liquidation_level: env_decimal("LIQUIDATION_LEVEL", "0.2"),
            commission_rate: env_decimal("COMMISSION_RATE", "0.0001"),

            is_paper_mode: env_bool("PAPER_MODE", true),
            paper_trading: PaperTradingConfig {
                slippage_enabled: env_bool("PAPER_SLIPPAGE_ENABLED", true),
                max_slippage_bps: env_parse("PAPER_MAX_SLIPPAGE_BPS", 5),
                latency_ms: env_parse("PAPER_LATENCY_MS", 50),
                rejection_rate: env_parse("PAPER_REJECTION_RATE", 0.0),
            },

            operation_timeout_ms: env_parse("OPERATION_TIMEOUT_MS", 30_000),
            database_timeout_ms: env_parse("DATABASE_TIMEOUT_MS", 15_000),
            integrity_check_timeout_ms: env_parse("INTEGRITY_CHECK_TIMEOUT_MS", 60_000),
            recovery_timeout_ms: env_parse("RECOVERY_TIMEOUT_MS", 120_000),

            monitoring_interval_ms: env_parse("MONITORING_INTERVAL_MS", 5_000),
            max_slippage_percent: env_decimal("MAX_SLIPPAGE_PERCENT", "5.0"),
            liquidation_fee_percent: env_decimal("LIQUIDATION_FEE_PERCENT", "0.5"),

            progress_tracking_enabled: env_bool("PROGRESS_TRACKING_ENABLED", true),
        };

        info!(
            database_path = %config.database_path,
            max_leverage = config.max_leverage,
            is_paper_mode = config.is_paper_mode,
            "engine configuration loaded"
        );

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Clear any env vars a prior test in the same process might have set.
        for key in ["MAX_LEVERAGE", "MARGIN_CALL_LEVEL", "LIQUIDATION_LEVEL"] {
            std::env::remove_var(key);
        }
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.max_leverage, 100);
        assert_eq!(cfg.margin_call_level, Decimal::from_str("0.5").unwrap());
        assert_eq!(cfg.liquidation_level, Decimal::from_str("0.2").unwrap());
        assert!(cfg.is_paper_mode);
        assert_eq!(cfg.leverage_policy, LeveragePolicy::Reject);
    }

    #[test]
    fn leverage_policy_parses_cap() {
        assert_eq!(LeveragePolicy::from_env_str("cap"), LeveragePolicy::Cap);
        assert_eq!(
            LeveragePolicy::from_env_str("reject"),
            LeveragePolicy::Reject
        );
        assert_eq!(
            LeveragePolicy::from_env_str("garbage"),
            LeveragePolicy::Reject
        );
    }
}
