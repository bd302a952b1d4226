//! Expiry sweeper
//!
//! Markets expire lazily on read, but a market nobody touches would stay
//! `active` past its window forever. This background task sweeps overdue
//! markets on an interval so the lifecycle moves even without traffic.

use crate::engine::MarketEngine;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Periodic expiry sweep over the engine
pub struct ExpirySweeper {
    engine: Arc<MarketEngine>,
    period: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper with the engine-configured interval
    pub fn new(engine: Arc<MarketEngine>, period: Duration) -> Self {
        Self { engine, period }
    }

    /// Run the sweep loop until the task is dropped
    pub async fn run(self) {
        tracing::info!(period_secs = self.period.as_secs_f64(), "Expiry sweeper started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.engine.expire_due() {
                Ok(0) => {}
                Ok(expired) => {
                    tracing::debug!(expired, "Sweep pass complete");
                }
                Err(e) => {
                    // Next tick retries; the lazy path also covers us
                    tracing::error!(error = %e, "Expiry sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        identity::StaticIdentity,
        types::CreateMarket,
    };
    use market_ledger::{LedgerStore, MarketStatus, MemoryStore, StreamId, UserId};

    #[tokio::test]
    async fn test_sweeper_ends_overdue_market() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(
            MarketEngine::new(
                store.clone(),
                Arc::new(StaticIdentity::new()),
                EngineConfig::default(),
            )
            .unwrap(),
        );

        let market = engine
            .create_market(CreateMarket {
                stream_id: StreamId::new("stream-1"),
                admin_id: UserId::new("admin"),
                question: "Quick one?".to_string(),
                ends_at: chrono::Utc::now() + chrono::Duration::milliseconds(50),
            })
            .unwrap();

        let sweeper = ExpirySweeper::new(engine.clone(), Duration::from_millis(20));
        let handle = tokio::spawn(sweeper.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        let market = store.get_market(market.market_id).unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Ended);
    }
}
