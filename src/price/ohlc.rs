// =============================================================================
// Brownian-Bridge OHLC Reconstruction
// =============================================================================
//
// A single tick only gives us an open and a close; high/low are reconstructed
// by sampling a short Brownian bridge between them in log-price space and
// taking the path's extremes, the same approximation the original price
// generator uses (two intermediate perturbations rather than a full path).
// =============================================================================

use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Clamp `price` into the daily band `[previous_close * (1 - limit_pct), previous_close *
/// (1 + limit_pct)]`, additionally floored at 0.01.
pub fn apply_price_limit(price: f64, previous_close: f64, limit_pct: f64) -> f64 {
    let upper = previous_close * (1.0 + limit_pct);
    let lower = previous_close * (1.0 - limit_pct);
    price.clamp(lower.min(upper), upper.max(lower)).max(0.01)
}

/// Reconstruct `(high, low)` for a bar given its open, (already clamped) close, and the
/// log return actually realised between them.
///
/// Samples two intermediate perturbations `u, v ~ N(0, (|log_return| / 2)^2)`, builds the
/// path `(0, u, u+v, log_return)` in log-price space, maps each point back through
/// `open * exp(p)`, clamps every point to the same daily band as the close, and takes the
/// path's max/min — widened if necessary so `high >= max(open, close)` and
/// `low <= min(open, close)`.
pub fn reconstruct_ohlc(
    open: f64,
    close: f64,
    log_return: f64,
    previous_close: f64,
    limit_pct: f64,
    rng: &mut impl Rng,
) -> (f64, f64) {
    let sigma_bridge = (log_return.abs() / 2.0).max(1e-12);
    let normal = Normal::new(0.0, sigma_bridge).expect("valid bridge sigma");

    let u = normal.sample(rng);
    let v = normal.sample(rng);

    let path = [0.0, u, u + v, log_return];
    let mut high = f64::MIN;
    let mut low = f64::MAX;

    for &p in &path {
        let price = apply_price_limit(open * p.exp(), previous_close, limit_pct);
        high = high.max(price);
        low = low.min(price);
    }

    high = high.max(open).max(close);
    low = low.min(open).min(close);

    (high, low)
}
