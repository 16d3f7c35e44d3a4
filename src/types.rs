// =============================================================================
// Shared types — the market data model
// =============================================================================

use serde::{Deserialize, Serialize};

/// Static definition of a tracked instrument. Created once by the seed
/// collaborator (out of scope here) and treated as immutable by the core;
/// only the dynamic snapshot fields change per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub name: String,
    pub sector_code: String,
    /// Market capitalisation in the smallest currency unit.
    pub market_cap: i64,
    /// Sensitivity to the market factor.
    pub beta_market: f64,
    /// Base annualised idiosyncratic volatility.
    pub sigma_annual: f64,
}

/// A sector grouping of instruments, carrying its own beta to the market
/// factor so sector-level shocks can be scaled per-sector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    pub code: String,
    pub name: String,
    pub beta_sector: f64,
}

/// Calculation method for an [`Index`]. Cap-weighted is the only one the
/// PriceEngine/IndexEngine pipeline implements; equal-weighted is recorded
/// as a variant for schema completeness but the engine treats it identically
/// to cap-weighted (constituent weights already encode the desired scheme).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationMethod {
    CapWeighted,
    EqualWeighted,
}

impl std::fmt::Display for CalculationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapWeighted => write!(f, "cap_weighted"),
            Self::EqualWeighted => write!(f, "equal_weighted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub code: String,
    pub name: String,
    pub base_value: f64,
    pub calculation_method: CalculationMethod,
    pub current_value: f64,
    pub previous_close: f64,
}

/// One (index, symbol) membership row with its normalised weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConstituent {
    pub index_code: String,
    pub symbol: String,
    pub weight: f64,
    pub is_active: bool,
}

/// Which kind of entity a [`Bar`] or snapshot row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    Stock,
    Index,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stock => write!(f, "STOCK"),
            Self::Index => write!(f, "INDEX"),
        }
    }
}

/// A single time-bucketed OHLCV record.
///
/// Invariant: `low <= min(open, close) <= max(open, close) <= high` and
/// `low > 0`. Constructors in `price::ohlc` are responsible for upholding it;
/// nothing downstream re-derives high/low from open/close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub target_type: TargetType,
    pub target_code: String,
    pub interval: String,
    pub timestamp_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
    pub change_pct: f64,
}

/// Current dynamic snapshot for one instrument, as returned by
/// `BarStore::SnapshotReadAll`. Mirrors the dynamic columns of the `stocks`
/// table: this is state carried *between* ticks, not a tick's full OHLCV
/// output (see `price::TickQuote` for that).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub previous_close: f64,
    pub change_value: f64,
    pub change_pct: f64,
    pub updated_at: i64,
}

/// Current dynamic snapshot for one index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub code: String,
    pub name: String,
    pub current_value: f64,
    pub previous_close: f64,
    pub change_value: f64,
    pub change_pct: f64,
}

/// Global market mode. SIDEWAYS is the initial state; there is no terminal
/// state, the engine runs indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    Bull,
    Bear,
    Sideways,
}

impl Default for MarketRegime {
    fn default() -> Self {
        Self::Sideways
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "BULL"),
            Self::Bear => write!(f, "BEAR"),
            Self::Sideways => write!(f, "SIDEWAYS"),
        }
    }
}
