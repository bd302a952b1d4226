//! Configuration for the settlement engine

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Transaction fee charged to the bettor on top of the stake,
    /// as a fraction of the stake (0.02 = 2%)
    pub fee_rate: Decimal,

    /// Floor for the per-share price, guarding the zero-volume side
    pub min_price: Decimal,

    /// Balance granted when a user record is first created
    pub starting_balance: Decimal,

    /// How often the background sweep expires overdue markets (seconds)
    pub sweep_interval_secs: u64,

    /// Retry bound for version-guarded read-modify-write updates
    /// (balances, market counters)
    pub conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(2, 2),         // 2%
            min_price: Decimal::new(1, 2),        // 0.01
            starting_balance: Decimal::new(100000, 2), // 1000.00
            sweep_interval_secs: 30,
            conflict_retries: 8,
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check configuration invariants
    pub fn validate(&self) -> crate::Result<()> {
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(crate::Error::Config(format!(
                "fee_rate must be in [0, 1): {}",
                self.fee_rate
            )));
        }
        if self.min_price <= Decimal::ZERO {
            return Err(crate::Error::Config(format!(
                "min_price must be positive: {}",
                self.min_price
            )));
        }
        if self.starting_balance < Decimal::ZERO {
            return Err(crate::Error::Config(format!(
                "starting_balance must be non-negative: {}",
                self.starting_balance
            )));
        }
        Ok(())
    }
}
