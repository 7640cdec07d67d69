//! Margin Trading Position Lifecycle Engine
//!
//! Exposes the core engine modules for use by the binary and integration tests.

pub mod api;
pub mod auth;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod event_store;
pub mod execution_tracker;
pub mod integrity;
pub mod liquidation;
pub mod middleware;
pub mod ops;
pub mod paper_execution;
pub mod persistence;
pub mod pnl;
pub mod risk_ledger;
pub mod sltp_monitor;
pub mod state_machine;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
