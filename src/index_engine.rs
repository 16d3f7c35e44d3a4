// =============================================================================
// IndexEngine — weighted recomputation of index values from fresh prices
// =============================================================================
//
// Grounded on the original index_calculator.py: a cap-weighted normalised
// average of constituent prices scaled by a fixed factor K so the index
// value stays near its base_value. The live tick path always has every
// constituent price available; the 80%-availability skip rule only matters
// for the backfill path, which recomputes bars from persisted history.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use tracing::warn;

use crate::error::EngineResult;
use crate::store::Store;
use crate::types::{Bar, Index, IndexConstituent, IndexSnapshot, TargetType};

/// Minimum fraction of constituents that must have a known price for a
/// backfilled bar to be produced; below this the bar is skipped.
const MIN_AVAILABILITY: f64 = 0.80;

pub struct IndexEngine {
    /// Fixed scaling factor K (see §4.4 / §9 — chosen once and never varied).
    scale_k: f64,
}

impl IndexEngine {
    pub fn new(scale_k: f64) -> Self {
        Self { scale_k }
    }

    /// Recompute one index's current value from a fresh price map, returning
    /// its updated snapshot and the tick's bar. `prices` must contain every
    /// active constituent's post-tick close — the live path guarantees this,
    /// so there is no availability check here (unlike `backfill_historical`).
    pub fn recompute(
        &self,
        index: &Index,
        constituents: &[IndexConstituent],
        prices: &HashMap<String, f64>,
    ) -> Option<(IndexSnapshot, Bar)> {
        let active: Vec<&IndexConstituent> = constituents.iter().filter(|c| c.is_active).collect();
        if active.is_empty() {
            warn!(index = %index.code, "no active constituents, skipping recompute");
            return None;
        }

        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for c in &active {
            let Some(&price) = prices.get(&c.symbol) else {
                warn!(index = %index.code, symbol = %c.symbol, "missing constituent price on live tick");
                continue;
            };
            weighted_sum += price * c.weight;
            total_weight += c.weight;
        }

        if total_weight <= 0.0 {
            return None;
        }

        let current_value = (weighted_sum / total_weight) * self.scale_k;
        let previous_close = if index.previous_close > 0.0 {
            index.previous_close
        } else {
            index.base_value
        };

        let change_value = current_value - previous_close;
        let change_pct = if previous_close > 0.0 {
            100.0 * (current_value / previous_close - 1.0)
        } else {
            0.0
        };

        let snapshot = IndexSnapshot {
            code: index.code.clone(),
            name: index.name.clone(),
            current_value,
            previous_close,
            change_value,
            change_pct,
        };

        let bar = Bar {
            target_type: TargetType::Index,
            target_code: index.code.clone(),
            interval: "tick".to_string(),
            timestamp_start: Utc::now().timestamp(),
            open: previous_close,
            high: previous_close.max(current_value),
            low: previous_close.min(current_value).max(0.01),
            close: current_value,
            volume: 0.0,
            turnover: 0.0,
            change_pct,
        };

        Some((snapshot, bar))
    }

    /// Recompute every index in `indices` from the fresh instrument price map,
    /// returning one `(snapshot, bar)` pair per index that had at least one
    /// priced constituent.
    pub fn recompute_all(
        &self,
        indices: &[Index],
        constituents_by_index: &HashMap<String, Vec<IndexConstituent>>,
        prices: &HashMap<String, f64>,
    ) -> Vec<(IndexSnapshot, Bar)> {
        indices
            .iter()
            .filter_map(|index| {
                let constituents = constituents_by_index.get(&index.code)?;
                self.recompute(index, constituents, prices)
            })
            .collect()
    }

    /// Recompute one index's historical bar for a single timestamp from
    /// persisted per-instrument history, skipping the bar if fewer than
    /// `MIN_AVAILABILITY` of its constituents have a bar at that timestamp.
    /// Additive to the live tick path — grounded on
    /// `calculate_index_from_historical_prices` in the original implementation.
    pub async fn backfill_historical(
        &self,
        store: &dyn Store,
        index: &Index,
        constituents: &[IndexConstituent],
        interval: &str,
        timestamps: &[i64],
    ) -> EngineResult<Vec<Bar>> {
        let active: Vec<&IndexConstituent> = constituents.iter().filter(|c| c.is_active).collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let mut bars = Vec::with_capacity(timestamps.len());
        let mut previous_close: Option<f64> = None;

        for &ts in timestamps {
            let mut open_sum = 0.0;
            let mut high_sum = 0.0;
            let mut low_sum = 0.0;
            let mut close_sum = 0.0;
            let mut total_weight = 0.0;
            let mut found = 0usize;

            for c in &active {
                let history = store
                    .history_range("STOCK", &c.symbol, interval, ts, ts)
                    .await?;
                let Some(stock_bar) = history.into_iter().find(|b| b.timestamp_start == ts) else {
                    continue;
                };
                found += 1;
                open_sum += stock_bar.open * c.weight;
                high_sum += stock_bar.high * c.weight;
                low_sum += stock_bar.low * c.weight;
                close_sum += stock_bar.close * c.weight;
                total_weight += c.weight;
            }

            let availability = found as f64 / active.len() as f64;
            if availability < MIN_AVAILABILITY || total_weight <= 0.0 {
                warn!(
                    index = %index.code,
                    timestamp = ts,
                    availability,
                    "insufficient constituent data, skipping backfilled bar"
                );
                continue;
            }

            let close = (close_sum / total_weight) * self.scale_k;
            let open = (open_sum / total_weight) * self.scale_k;
            let high = (high_sum / total_weight) * self.scale_k;
            let low = (low_sum / total_weight) * self.scale_k;

            let change_pct = match previous_close {
                Some(prev) if prev > 0.0 => 100.0 * (close / prev - 1.0),
                _ => 0.0,
            };

            bars.push(Bar {
                target_type: TargetType::Index,
                target_code: index.code.clone(),
                interval: interval.to_string(),
                timestamp_start: ts,
                open,
                high: high.max(open).max(close),
                low: low.min(open).min(close).max(0.01),
                close,
                volume: 0.0,
                turnover: 0.0,
                change_pct,
            });

            previous_close = Some(close);
        }

        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CalculationMethod;

    fn sample_index() -> Index {
        Index {
            code: "DEMO300".into(),
            name: "Demo 300".into(),
            base_value: 1000.0,
            calculation_method: CalculationMethod::CapWeighted,
            current_value: 1000.0,
            previous_close: 1000.0,
        }
    }

    #[test]
    fn index_recomputation_scales_linearly_with_weighted_prices() {
        let engine = IndexEngine::new(10.0);
        let index = Index {
            previous_close: 860.0, // weighted avg(100,50) * 10 before the tick
            ..sample_index()
        };
        let constituents = vec![
            IndexConstituent { index_code: "DEMO300".into(), symbol: "A".into(), weight: 0.6, is_active: true },
            IndexConstituent { index_code: "DEMO300".into(), symbol: "B".into(), weight: 0.4, is_active: true },
        ];
        let prices: HashMap<String, f64> = [("A".to_string(), 110.0), ("B".to_string(), 55.0)].into();

        let (snapshot, bar) = engine.recompute(&index, &constituents, &prices).unwrap();

        // weighted avg = 0.6*110 + 0.4*55 = 88.0, * K=10 => 880.0
        assert!((snapshot.current_value - 880.0).abs() < 1e-9);
        assert!((snapshot.change_pct - 2.325581395).abs() < 1e-6);
        assert!((bar.close - 880.0).abs() < 1e-9);
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
    }

    #[test]
    fn ten_percent_uniform_move_yields_ten_percent_change_pct() {
        // Pre-tick weighted avg(100, 50) * K=10 = 800.0; a uniform +10% move
        // on both constituents (110, 55) must land change_pct at exactly 10.0.
        let engine = IndexEngine::new(10.0);
        let index = Index { previous_close: 800.0, ..sample_index() };
        let constituents = vec![
            IndexConstituent { index_code: "DEMO300".into(), symbol: "A".into(), weight: 0.6, is_active: true },
            IndexConstituent { index_code: "DEMO300".into(), symbol: "B".into(), weight: 0.4, is_active: true },
        ];
        let prices: HashMap<String, f64> = [("A".to_string(), 110.0), ("B".to_string(), 55.0)].into();

        let (snapshot, _) = engine.recompute(&index, &constituents, &prices).unwrap();
        assert!((snapshot.current_value - 880.0).abs() < 1e-9);
        assert!((snapshot.change_pct - 10.0).abs() < 1e-6);
    }

    #[test]
    fn inactive_constituents_are_excluded_from_the_sum() {
        let engine = IndexEngine::new(10.0);
        let index = sample_index();
        let constituents = vec![
            IndexConstituent { index_code: "DEMO300".into(), symbol: "A".into(), weight: 0.6, is_active: true },
            IndexConstituent { index_code: "DEMO300".into(), symbol: "B".into(), weight: 0.4, is_active: false },
        ];
        let prices: HashMap<String, f64> = [("A".to_string(), 100.0), ("B".to_string(), 1_000_000.0)].into();

        let (snapshot, _) = engine.recompute(&index, &constituents, &prices).unwrap();
        // Only A counts: weighted avg = 100 (weight normalised to 1.0 within active set).
        assert!((snapshot.current_value - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn no_active_constituents_returns_none() {
        let engine = IndexEngine::new(10.0);
        let index = sample_index();
        let constituents = vec![IndexConstituent {
            index_code: "DEMO300".into(),
            symbol: "A".into(),
            weight: 1.0,
            is_active: false,
        }];
        let prices: HashMap<String, f64> = [("A".to_string(), 100.0)].into();
        assert!(engine.recompute(&index, &constituents, &prices).is_none());
    }
}
