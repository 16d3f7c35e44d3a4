// =============================================================================
// BarStore — snapshot + append-only history persistence
// =============================================================================
//
// Expressed as an explicit `Store` trait per the design notes ("replace
// dynamic dispatch with explicit capability interfaces"), so PriceEngine,
// IndexEngine and RegimeController depend on a capability rather than a
// concrete database. `SqliteStore` is the shipped implementation.
// =============================================================================

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::types::{Bar, Index, IndexConstituent, IndexSnapshot, Instrument, InstrumentSnapshot, MarketRegime, Sector};

/// One row of the `market_states` table, as persisted by RegimeController.
#[derive(Debug, Clone)]
pub struct MarketRegimeRow {
    pub id: i64,
    pub regime: MarketRegime,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub daily_drift: f64,
    pub volatility_multiplier: f64,
    pub is_current: bool,
}

/// Everything produced by a single tick that must land in the store
/// atomically: the fresh instrument/index snapshots and their new bars.
/// Readers must never observe only half of this write.
#[derive(Debug, Clone, Default)]
pub struct TickCommit {
    pub instruments: Vec<InstrumentSnapshot>,
    pub indices: Vec<IndexSnapshot>,
    pub bars: Vec<Bar>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Consistent read of current dynamic state for all active instruments.
    async fn snapshot_read_all(&self) -> EngineResult<Vec<InstrumentSnapshot>>;

    /// Consistent read of current dynamic state for all indices.
    async fn snapshot_read_all_indices(&self) -> EngineResult<Vec<IndexSnapshot>>;

    /// Atomically persist a tick's instrument/index snapshots and append
    /// their bars to history. Either the whole commit becomes visible to
    /// readers or none of it does.
    async fn commit_tick(&self, commit: TickCommit) -> EngineResult<()>;

    /// Last `limit` bars for one target, newest first.
    async fn history_last_n(
        &self,
        target_type: &str,
        target_code: &str,
        interval: &str,
        limit: usize,
    ) -> EngineResult<Vec<Bar>>;

    /// Bars for one target within `[from_ts, to_ts]`, ascending.
    async fn history_range(
        &self,
        target_type: &str,
        target_code: &str,
        interval: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> EngineResult<Vec<Bar>>;

    /// The regime row currently marked `is_current = true`, if any.
    async fn current_regime(&self) -> EngineResult<Option<MarketRegimeRow>>;

    /// Close out the current regime row (set `end_time`, `is_current =
    /// false`) and insert the new one as current. Returns the new row.
    async fn record_regime_transition(
        &self,
        regime: MarketRegime,
        start_time: i64,
        daily_drift: f64,
        volatility_multiplier: f64,
    ) -> EngineResult<MarketRegimeRow>;

    /// The static instrument catalog (joins `stocks` with `stock_metadata`).
    /// Populated by the out-of-scope seed collaborator; an empty result
    /// means the store hasn't been seeded yet, not an error.
    async fn load_instruments(&self) -> EngineResult<Vec<Instrument>>;

    /// The static sector catalog.
    async fn load_sectors(&self) -> EngineResult<Vec<Sector>>;

    /// The static index catalog.
    async fn load_indices(&self) -> EngineResult<Vec<Index>>;

    /// The static index membership table, across every index.
    async fn load_index_constituents(&self) -> EngineResult<Vec<IndexConstituent>>;
}
