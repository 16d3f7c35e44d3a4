// =============================================================================
// PriceEngine — three-layer log-return stochastic price model
// =============================================================================
//
// One market shock and one sector shock are drawn once per tick and shared
// across every instrument; only the idiosyncratic shock varies per
// instrument. `advance_instrument` is a pure function of (previous snapshot,
// shared shocks, idiosyncratic shock) so it is safe to call concurrently
// across instruments — the caller owns joining the results into a single
// snapshot before handing off to IndexEngine.
// =============================================================================

use chrono::Utc;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::RuntimeConfig;
use crate::error::{EngineError, EngineResult};
use crate::price::ohlc::{apply_price_limit, reconstruct_ohlc};
use crate::store::MarketRegimeRow;
use crate::types::{Bar, Instrument, InstrumentSnapshot, TargetType};

/// Base Poisson mean and constant floor for the simulated per-tick volume.
const VOLUME_POISSON_MEAN: f64 = 5000.0;
const VOLUME_FLOOR: f64 = 10000.0;
const VOLUME_RETURN_SCALE: f64 = 50.0;

/// The market and sector shocks shared by every instrument within one tick.
/// `z_sector` already carries the `RHO_MS` correlation with `z_market`.
#[derive(Debug, Clone, Copy)]
pub struct TickShocks {
    pub z_market: f64,
    pub z_sector: f64,
}

/// The full result of advancing one instrument by one tick: its fresh
/// dynamic snapshot plus the bar recording the tick's OHLCV.
#[derive(Debug, Clone)]
pub struct TickQuote {
    pub snapshot: InstrumentSnapshot,
    pub bar: Bar,
    pub capped: bool,
}

pub struct PriceEngine {
    dt: f64,
    sigma_m_day: f64,
    sigma_s_day: f64,
    sigma_i_day_default: f64,
    trading_days_sqrt: f64,
    price_limit_pct: f64,
    weights_msi: (f64, f64, f64),
    rho_ms: f64,
}

impl PriceEngine {
    pub fn new(config: &RuntimeConfig) -> Self {
        let trading_days_sqrt = (config.trading_days_per_year as f64).sqrt();
        Self {
            dt: config.dt(),
            sigma_m_day: config.sigma_market_annual / trading_days_sqrt,
            sigma_s_day: config.sigma_sector_annual / trading_days_sqrt,
            sigma_i_day_default: config.sigma_individual_annual / trading_days_sqrt,
            trading_days_sqrt,
            price_limit_pct: config.price_limit_pct,
            weights_msi: config.weights_msi,
            rho_ms: config.rho_ms,
        }
    }

    /// Draw the market/sector shocks shared by the whole tick.
    /// `Corr(z_market, z_sector) = rho_ms` via `z_sector = rho*z0 + sqrt(1-rho^2)*z1`.
    pub fn draw_shared_shocks(&self, rng: &mut impl Rng) -> TickShocks {
        let normal = Normal::new(0.0, 1.0).expect("N(0,1) is always valid");
        let z0 = normal.sample(rng);
        let z1 = normal.sample(rng);
        let z_sector = self.rho_ms * z0 + (1.0 - self.rho_ms * self.rho_ms).sqrt() * z1;
        TickShocks { z_market: z0, z_sector }
    }

    /// Advance one instrument by a single tick.
    ///
    /// Returns `Err(InvariantViolation)` if the reconstructed bar would violate the
    /// OHLC ordering invariant — the caller must abort the whole tick in that case,
    /// never commit a partial snapshot.
    pub fn advance_instrument(
        &self,
        instrument: &Instrument,
        sector_beta: f64,
        previous: &InstrumentSnapshot,
        regime: &MarketRegimeRow,
        shocks: TickShocks,
        rng: &mut impl Rng,
    ) -> EngineResult<TickQuote> {
        let normal = Normal::new(0.0, 1.0).expect("N(0,1) is always valid");
        let z_i = normal.sample(rng);

        let sigma_i_day = if instrument.sigma_annual > 0.0 {
            instrument.sigma_annual / self.trading_days_sqrt
        } else {
            self.sigma_i_day_default
        };

        let sqrt_dt = self.dt.sqrt();
        let r_m = regime.daily_drift * self.dt + self.sigma_m_day * sqrt_dt * shocks.z_market;
        let r_s = self.sigma_s_day * sqrt_dt * shocks.z_sector;
        let r_i = sigma_i_day * sqrt_dt * z_i;

        let (w_m, w_s, w_i) = self.weights_msi;
        let r_total = w_m * instrument.beta_market * r_m + w_s * sector_beta * r_s + w_i * r_i;

        let open = previous.price;
        let raw_close = open * r_total.exp();
        let close = apply_price_limit(raw_close, previous.previous_close, self.price_limit_pct);
        let capped = (close - raw_close).abs() > f64::EPSILON;

        // The bar's realised log return is re-derived from the clamped close, not the
        // uncapped draw, so OHLC reconstruction and the volume model see the same
        // number that was actually persisted.
        let realized_return = (close / open).ln();

        let (high, low) = reconstruct_ohlc(
            open,
            close,
            realized_return,
            previous.previous_close,
            self.price_limit_pct,
            rng,
        );

        if !(low > 0.0
            && low <= open.min(close)
            && open.max(close) <= high
            && high.is_finite()
            && low.is_finite())
        {
            return Err(EngineError::InvariantViolation(format!(
                "OHLC ordering violated for {}: open={open} high={high} low={low} close={close}",
                instrument.symbol
            )));
        }

        let volume = simulate_volume(realized_return, rng);
        let turnover = volume * close;

        let change_value = close - previous.previous_close;
        let change_pct = if previous.previous_close > 0.0 {
            100.0 * (close / previous.previous_close - 1.0)
        } else {
            0.0
        };

        let now = Utc::now().timestamp();

        let snapshot = InstrumentSnapshot {
            symbol: instrument.symbol.clone(),
            name: instrument.name.clone(),
            price: close,
            previous_close: previous.previous_close,
            change_value,
            change_pct,
            updated_at: now,
        };

        let bar = Bar {
            target_type: TargetType::Stock,
            target_code: instrument.symbol.clone(),
            interval: "tick".to_string(),
            timestamp_start: now,
            open,
            high,
            low,
            close,
            volume,
            turnover,
            change_pct,
        };

        Ok(TickQuote { snapshot, bar, capped })
    }
}

/// Base Poisson(5000) plus a constant floor, scaled up when the tick moved a lot.
fn simulate_volume(log_return: f64, rng: &mut impl Rng) -> f64 {
    let poisson_draw = rand_distr::Poisson::new(VOLUME_POISSON_MEAN)
        .expect("static Poisson mean is valid")
        .sample(rng);
    let base_volume = VOLUME_FLOOR + poisson_draw;
    base_volume * (1.0 + VOLUME_RETURN_SCALE * log_return.abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn flat_regime() -> MarketRegimeRow {
        MarketRegimeRow {
            id: 1,
            regime: crate::types::MarketRegime::Sideways,
            start_time: 0,
            end_time: None,
            daily_drift: 0.0,
            volatility_multiplier: 1.0,
            is_current: true,
        }
    }

    fn zero_vol_config() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.sigma_market_annual = 0.0;
        cfg.sigma_sector_annual = 0.0;
        cfg.sigma_individual_annual = 0.0;
        cfg
    }

    #[test]
    fn zero_drift_zero_vol_leaves_price_unchanged() {
        let cfg = zero_vol_config();
        let engine = PriceEngine::new(&cfg);
        let instrument = Instrument {
            symbol: "AAA".into(),
            name: "AAA Inc".into(),
            sector_code: "TECH".into(),
            market_cap: 1_000_000,
            beta_market: 1.0,
            sigma_annual: 0.0,
        };
        let previous = InstrumentSnapshot {
            symbol: "AAA".into(),
            name: "AAA Inc".into(),
            price: 100.0,
            previous_close: 100.0,
            change_value: 0.0,
            change_pct: 0.0,
            updated_at: 0,
        };
        let regime = flat_regime();
        let mut rng = StdRng::seed_from_u64(7);
        let shocks = engine.draw_shared_shocks(&mut rng);

        let quote = engine
            .advance_instrument(&instrument, 1.0, &previous, &regime, shocks, &mut rng)
            .unwrap();

        assert!((quote.snapshot.price - 100.0).abs() < 1e-9);
        assert!((quote.bar.high - 100.0).abs() < 1e-9);
        assert!((quote.bar.low - 100.0).abs() < 1e-9);
        assert!(quote.bar.change_pct.abs() < 1e-9);
        assert!(!quote.capped);
    }

    #[test]
    fn extreme_return_is_clamped_to_band_edge() {
        let cfg = RuntimeConfig::default();
        let engine = PriceEngine::new(&cfg);
        let instrument = Instrument {
            symbol: "BBB".into(),
            name: "BBB Inc".into(),
            sector_code: "TECH".into(),
            market_cap: 1_000_000,
            beta_market: 1.0,
            sigma_annual: 0.35,
        };
        let previous = InstrumentSnapshot {
            symbol: "BBB".into(),
            name: "BBB Inc".into(),
            price: 100.0,
            previous_close: 100.0,
            change_value: 0.0,
            change_pct: 0.0,
            updated_at: 0,
        };
        let regime = flat_regime();
        // A huge forced shock simulates "would exit the band": we bypass the
        // normal draw and directly exercise apply_price_limit through a
        // contrived shock pair.
        let shocks = TickShocks { z_market: 50.0, z_sector: 50.0 };
        let mut rng = StdRng::seed_from_u64(3);

        let quote = engine
            .advance_instrument(&instrument, 1.0, &previous, &regime, shocks, &mut rng)
            .unwrap();

        assert!((quote.snapshot.price - 110.0).abs() < 1e-6);
        assert!(quote.capped);
        assert!((quote.bar.change_pct - 10.0).abs() < 1e-6);
    }

    #[test]
    fn bar_invariant_always_holds_over_many_random_ticks() {
        let cfg = RuntimeConfig::default();
        let engine = PriceEngine::new(&cfg);
        let instrument = Instrument {
            symbol: "CCC".into(),
            name: "CCC Inc".into(),
            sector_code: "TECH".into(),
            market_cap: 1_000_000,
            beta_market: 1.2,
            sigma_annual: 0.40,
        };
        let regime = flat_regime();
        let mut rng = StdRng::seed_from_u64(99);
        let mut previous = InstrumentSnapshot {
            symbol: "CCC".into(),
            name: "CCC Inc".into(),
            price: 50.0,
            previous_close: 50.0,
            change_value: 0.0,
            change_pct: 0.0,
            updated_at: 0,
        };

        for _ in 0..500 {
            let shocks = engine.draw_shared_shocks(&mut rng);
            let quote = engine
                .advance_instrument(&instrument, 1.0, &previous, &regime, shocks, &mut rng)
                .unwrap();

            assert!(quote.bar.low > 0.0);
            assert!(quote.bar.low <= quote.bar.open.min(quote.bar.close));
            assert!(quote.bar.open.max(quote.bar.close) <= quote.bar.high);
            let drift = (quote.snapshot.price - previous.previous_close).abs()
                / previous.previous_close;
            assert!(drift <= 0.10 + 1e-6);

            previous = quote.snapshot;
        }
    }
}
