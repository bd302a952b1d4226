//! Metrics collection for observability
//!
//! Prometheus metrics for the engine. Registered against an owned
//! registry (not the process-global default) so embedders can mount it
//! wherever they serve metrics and tests can build engines freely.

use prometheus::{Counter, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Bets accepted
    pub bets_placed: IntCounter,

    /// Bets rejected by any guard
    pub bets_rejected: IntCounter,

    /// Markets created
    pub markets_created: IntCounter,

    /// Markets resolved
    pub markets_resolved: IntCounter,

    /// Markets cancelled
    pub markets_cancelled: IntCounter,

    /// Markets swept or lazily flipped to ended
    pub markets_expired: IntCounter,

    /// Total amount credited to winners
    pub payout_amount: Counter,

    /// Total amount refunded on cancellations
    pub refund_amount: Counter,

    /// Version-guarded updates that lost a race
    pub storage_conflicts: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let bets_placed = IntCounter::new("engine_bets_placed_total", "Bets accepted")?;
        registry.register(Box::new(bets_placed.clone()))?;

        let bets_rejected =
            IntCounter::new("engine_bets_rejected_total", "Bets rejected by any guard")?;
        registry.register(Box::new(bets_rejected.clone()))?;

        let markets_created = IntCounter::new("engine_markets_created_total", "Markets created")?;
        registry.register(Box::new(markets_created.clone()))?;

        let markets_resolved =
            IntCounter::new("engine_markets_resolved_total", "Markets resolved")?;
        registry.register(Box::new(markets_resolved.clone()))?;

        let markets_cancelled =
            IntCounter::new("engine_markets_cancelled_total", "Markets cancelled")?;
        registry.register(Box::new(markets_cancelled.clone()))?;

        let markets_expired = IntCounter::new(
            "engine_markets_expired_total",
            "Markets swept or lazily flipped to ended",
        )?;
        registry.register(Box::new(markets_expired.clone()))?;

        let payout_amount = Counter::new(
            "engine_payout_amount_total",
            "Total amount credited to winners",
        )?;
        registry.register(Box::new(payout_amount.clone()))?;

        let refund_amount = Counter::new(
            "engine_refund_amount_total",
            "Total amount refunded on cancellations",
        )?;
        registry.register(Box::new(refund_amount.clone()))?;

        let storage_conflicts = IntCounter::new(
            "engine_storage_conflicts_total",
            "Version-guarded updates that lost a race",
        )?;
        registry.register(Box::new(storage_conflicts.clone()))?;

        Ok(Self {
            bets_placed,
            bets_rejected,
            markets_created,
            markets_resolved,
            markets_cancelled,
            markets_expired,
            payout_amount,
            refund_amount,
            storage_conflicts,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metrics registration cannot fail on a fresh registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation_is_repeatable() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        assert_eq!(a.bets_placed.get(), 0);
        assert_eq!(b.bets_placed.get(), 0);
    }

    #[test]
    fn test_counters_record() {
        let metrics = Metrics::new().unwrap();
        metrics.bets_placed.inc();
        metrics.bets_placed.inc();
        metrics.payout_amount.inc_by(150.0);

        assert_eq!(metrics.bets_placed.get(), 2);
        assert!((metrics.payout_amount.get() - 150.0).abs() < f64::EPSILON);
        assert_eq!(metrics.registry.gather().len(), 9);
    }
}
