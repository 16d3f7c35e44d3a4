// =============================================================================
// Price Module
// =============================================================================
//
// The three-layer log-return stochastic engine: per-tick correlated
// market/sector shocks, idiosyncratic per-instrument noise, daily-band
// clamping, and Brownian-bridge OHLC reconstruction.

pub mod engine;
pub mod ohlc;

pub use engine::{PriceEngine, TickShocks, TickQuote};
