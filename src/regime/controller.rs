// =============================================================================
// RegimeController — Markov-driven market mode
// =============================================================================
//
// Caches the current MarketRegime in an `RwLock` for cheap concurrent reads
// (mirrors the cached-state pattern used for indicator-driven regime
// detection elsewhere in this codebase), but the classification itself is a
// fixed-probability Markov draw rather than a technical-indicator
// classifier: BULL/BEAR/SIDEWAYS with a minimum dwell time before any
// transition is considered.
// =============================================================================

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::info;

use crate::error::EngineResult;
use crate::store::{MarketRegimeRow, Store};
use crate::types::MarketRegime;

const STAY_PROBABILITY: f64 = 0.70;
const NEIGHBOUR_PROBABILITY: f64 = 0.15;

fn drift_band(regime: MarketRegime) -> (f64, f64) {
    match regime {
        MarketRegime::Bull => (0.003, 0.010),
        MarketRegime::Bear => (-0.010, -0.003),
        MarketRegime::Sideways => (-0.002, 0.002),
    }
}

fn volatility_multiplier(regime: MarketRegime) -> f64 {
    match regime {
        MarketRegime::Bull => 1.2,
        MarketRegime::Bear => 1.5,
        MarketRegime::Sideways => 1.0,
    }
}

fn neighbours(regime: MarketRegime) -> [MarketRegime; 2] {
    match regime {
        MarketRegime::Bull => [MarketRegime::Bear, MarketRegime::Sideways],
        MarketRegime::Bear => [MarketRegime::Bull, MarketRegime::Sideways],
        MarketRegime::Sideways => [MarketRegime::Bull, MarketRegime::Bear],
    }
}

/// Draw the next regime from the fixed Markov kernel: stay with probability
/// `STAY_PROBABILITY`, move to either neighbour with `NEIGHBOUR_PROBABILITY`
/// each.
fn sample_next_regime(current: MarketRegime, rng: &mut impl Rng) -> MarketRegime {
    let [n1, n2] = neighbours(current);
    let choices = [current, n1, n2];
    let weights = [STAY_PROBABILITY, NEIGHBOUR_PROBABILITY, NEIGHBOUR_PROBABILITY];
    let dist = WeightedIndex::new(weights).expect("static weights are valid");
    choices[dist.sample(rng)]
}

pub struct RegimeController {
    store: Arc<dyn Store>,
    state: parking_lot::RwLock<MarketRegimeRow>,
    min_dwell_days: u32,
}

impl RegimeController {
    /// Load the current regime from the store, or seed a fresh SIDEWAYS row
    /// if none exists yet (first boot).
    pub async fn init(store: Arc<dyn Store>, min_dwell_days: u32) -> EngineResult<Arc<Self>> {
        let existing = store.current_regime().await?;
        let state = match existing {
            Some(row) => row,
            None => {
                let now = chrono::Utc::now().timestamp();
                let mut rng = rand::thread_rng();
                let (lo, hi) = drift_band(MarketRegime::Sideways);
                let drift = rng.gen_range(lo..=hi);
                store
                    .record_regime_transition(
                        MarketRegime::Sideways,
                        now,
                        drift,
                        volatility_multiplier(MarketRegime::Sideways),
                    )
                    .await?
            }
        };

        info!(regime = %state.regime, "regime controller initialized");

        Ok(Arc::new(Self {
            store,
            state: parking_lot::RwLock::new(state),
            min_dwell_days,
        }))
    }

    /// Constant-time read of the current regime row.
    pub fn current(&self) -> MarketRegimeRow {
        self.state.read().clone()
    }

    /// Attempt a transition. Unless `force` is set, a minimum dwell time of
    /// `min_dwell_days` since the current regime's `start_time` must have
    /// elapsed, otherwise the call is a no-op returning the unchanged state.
    pub async fn transition(&self, force: Option<MarketRegime>) -> EngineResult<MarketRegimeRow> {
        let current = self.current();
        let now = chrono::Utc::now().timestamp();

        if force.is_none() {
            let elapsed_days = (now - current.start_time) as f64 / 86_400.0;
            if elapsed_days < self.min_dwell_days as f64 {
                return Ok(current);
            }
        }

        let next_regime = match force {
            Some(r) => r,
            None => {
                let mut rng = rand::thread_rng();
                sample_next_regime(current.regime, &mut rng)
            }
        };

        let mut rng = rand::thread_rng();
        let (lo, hi) = drift_band(next_regime);
        let daily_drift = rng.gen_range(lo..=hi);
        let vol_mult = volatility_multiplier(next_regime);

        let new_state = self
            .store
            .record_regime_transition(next_regime, now, daily_drift, vol_mult)
            .await?;

        info!(
            from = %current.regime,
            to = %new_state.regime,
            daily_drift = new_state.daily_drift,
            "market regime transitioned"
        );

        *self.state.write() = new_state.clone();
        Ok(new_state)
    }

    pub async fn force_bull(&self) -> EngineResult<MarketRegimeRow> {
        self.transition(Some(MarketRegime::Bull)).await
    }

    pub async fn force_bear(&self) -> EngineResult<MarketRegimeRow> {
        self.transition(Some(MarketRegime::Bear)).await
    }

    pub async fn force_sideways(&self) -> EngineResult<MarketRegimeRow> {
        self.transition(Some(MarketRegime::Sideways)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_bands_match_design() {
        assert_eq!(drift_band(MarketRegime::Bull), (0.003, 0.010));
        assert_eq!(drift_band(MarketRegime::Bear), (-0.010, -0.003));
        assert_eq!(drift_band(MarketRegime::Sideways), (-0.002, 0.002));
    }

    #[test]
    fn volatility_multipliers_match_design() {
        assert!((volatility_multiplier(MarketRegime::Bull) - 1.2).abs() < f64::EPSILON);
        assert!((volatility_multiplier(MarketRegime::Bear) - 1.5).abs() < f64::EPSILON);
        assert!((volatility_multiplier(MarketRegime::Sideways) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn neighbours_never_include_self() {
        for regime in [MarketRegime::Bull, MarketRegime::Bear, MarketRegime::Sideways] {
            let ns = neighbours(regime);
            assert!(!ns.contains(&regime));
        }
    }

    #[test]
    fn sample_next_regime_stays_most_of_the_time() {
        let mut rng = rand::thread_rng();
        let mut stay_count = 0;
        let trials = 2000;
        for _ in 0..trials {
            if sample_next_regime(MarketRegime::Sideways, &mut rng) == MarketRegime::Sideways {
                stay_count += 1;
            }
        }
        let stay_ratio = stay_count as f64 / trials as f64;
        // Statistical check with generous tolerance: should hover near 0.70.
        assert!(stay_ratio > 0.60 && stay_ratio < 0.80, "stay_ratio={stay_ratio}");
    }
}
