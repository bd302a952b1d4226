//! Trend recorder
//!
//! Append-only log of volume snapshots per market transition, consumed by
//! external charting. A failed append only degrades chart fidelity, never
//! financial correctness: it is logged and dropped, not retried, and the
//! triggering operation succeeds regardless.

use crate::types::TrendEntry;
use chrono::{DateTime, Utc};
use market_ledger::{LedgerStore, Market, Result, StreamId, TrendPoint};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::sync::Arc;

/// Records and serves volume snapshots
#[derive(Clone)]
pub struct TrendRecorder {
    store: Arc<dyn LedgerStore>,
}

impl TrendRecorder {
    /// Create a recorder over the store
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Append one snapshot of the market's cumulative volumes
    pub fn snapshot(&self, market: &Market) {
        self.snapshot_at(market, Utc::now());
    }

    /// Append one snapshot with an explicit timestamp
    pub fn snapshot_at(&self, market: &Market, now: DateTime<Utc>) {
        let point = TrendPoint {
            stream_id: market.stream_id.clone(),
            market_id: market.market_id,
            yes_volume: market.yes_volume,
            no_volume: market.no_volume,
            recorded_at: now,
        };

        if let Err(e) = self.store.append_trend(&point) {
            // Chart fidelity only; the triggering operation already stands
            tracing::warn!(
                market_id = %market.market_id,
                stream_id = %market.stream_id,
                error = %e,
                "Trend append failed, snapshot dropped"
            );
        }
    }

    /// Wipe a stream's history; called when a brand-new market starts on
    /// it so the chart baseline resets
    pub fn reset(&self, stream_id: &StreamId) -> Result<()> {
        self.store.clear_trend(stream_id)
    }

    /// Ordered, time-bounded, normalized read for the chart consumer
    pub fn read(
        &self,
        stream_id: &StreamId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TrendEntry>> {
        let points = self.store.trend_for_stream(stream_id, since, limit)?;
        Ok(points.iter().map(normalize).collect())
    }
}

/// Normalize a raw snapshot to whole-number percentages; 50/50 on zero
/// volume. `no` is derived as the complement so the pair sums to 100.
fn normalize(point: &TrendPoint) -> TrendEntry {
    let total = point.yes_volume + point.no_volume;
    let yes_percent = if total > Decimal::ZERO {
        (point.yes_volume * Decimal::from(100) / total)
            .round()
            .to_u8()
            .unwrap_or(50)
    } else {
        50
    };

    TrendEntry {
        timestamp: point.recorded_at,
        yes_percent,
        no_percent: 100 - yes_percent,
    }
}
