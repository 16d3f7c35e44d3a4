// =============================================================================
// Regime Module
// =============================================================================
//
// Holds the global MarketRegime (BULL/BEAR/SIDEWAYS) and its drift/volatility
// parameters. Transitions are Markov-sampled and gated by a minimum dwell
// time; they are driven by a slow background task, never by the per-tick
// clock.

pub mod controller;

pub use controller::RegimeController;
