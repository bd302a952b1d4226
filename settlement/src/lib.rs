//! StakeRail Settlement Engine
//!
//! The market settlement and ledger engine for stream-attached binary
//! markets: lifecycle state machine, pari-mutuel pricing, position
//! ledger, payout/refund settlement and trend recording, all over the
//! `market-ledger` store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use settlement::{EngineConfig, MarketEngine, StaticIdentity};
//! use market_ledger::{open_store, StoreConfig};
//!
//! fn main() -> settlement::Result<()> {
//!     market_ledger::init_tracing();
//!
//!     let store = open_store(&StoreConfig::from_env()?)?;
//!     let identity = Arc::new(StaticIdentity::new());
//!     let engine = MarketEngine::new(store, identity, EngineConfig::default())?;
//!
//!     // let receipt = engine.place_bet(...)?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod pricing;
pub mod settle;
pub mod sweeper;
pub mod trend;
pub mod types;

// Re-exports
pub use config::EngineConfig;
pub use engine::MarketEngine;
pub use error::{Error, Result};
pub use identity::{Identity, StaticIdentity};
pub use metrics::Metrics;
pub use sweeper::ExpirySweeper;
pub use trend::TrendRecorder;
pub use types::{
    BetReceipt, BetRequest, CreateMarket, Refund, RefundReport, SettlementFailure,
    SettlementReport, TrendEntry,
};
