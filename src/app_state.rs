// =============================================================================
// Central Application State — the tick pipeline's collaborators
// =============================================================================
//
// `AppState` ties together every collaborator the tick pipeline and the
// WebSocket surface depend on: the persistence layer, the regime, price and
// index engines, the publish path, and the session hub. It owns the static
// catalog loaded once at startup (out of scope to generate, in scope to
// read) and the single per-tick RNG, since exactly one tick runs at a time.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, warn};

use crate::bus::Bus;
use crate::config::RuntimeConfig;
use crate::index_engine::IndexEngine;
use crate::price::PriceEngine;
use crate::publisher::Publisher;
use crate::regime::RegimeController;
use crate::session::SessionHub;
use crate::store::{Store, TickCommit};
use crate::types::{Bar, Index, IndexConstituent, Instrument, Sector};

/// Static catalog loaded once at startup from the store's seed tables.
/// Never mutated by the core; only read.
pub struct Catalog {
    pub instruments: Vec<Instrument>,
    pub sectors: HashMap<String, Sector>,
    pub indices: Vec<Index>,
    pub constituents_by_index: HashMap<String, Vec<IndexConstituent>>,
}

impl Catalog {
    pub async fn load(store: &dyn Store) -> anyhow::Result<Self> {
        let instruments = store.load_instruments().await?;
        let sectors: HashMap<String, Sector> =
            store.load_sectors().await?.into_iter().map(|s| (s.code.clone(), s)).collect();
        let indices = store.load_indices().await?;
        let constituents = store.load_index_constituents().await?;

        let mut constituents_by_index: HashMap<String, Vec<IndexConstituent>> = HashMap::new();
        for c in constituents {
            constituents_by_index.entry(c.index_code.clone()).or_default().push(c);
        }

        if instruments.is_empty() {
            warn!("no instruments in the store; tick pipeline will idle until it is seeded");
        }

        Ok(Self { instruments, sectors, indices, constituents_by_index })
    }
}

pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<dyn Store>,
    pub regime: Arc<RegimeController>,
    pub price_engine: PriceEngine,
    pub index_engine: IndexEngine,
    pub bus: Arc<dyn Bus>,
    pub publisher: Publisher,
    pub sessions: Arc<SessionHub>,
    pub catalog: Catalog,
    rng: Mutex<StdRng>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn Store>,
        regime: Arc<RegimeController>,
        bus: Arc<dyn Bus>,
        sessions: Arc<SessionHub>,
        catalog: Catalog,
    ) -> Self {
        let price_engine = PriceEngine::new(&config);
        let index_engine = IndexEngine::new(config.index_scale_k);
        let publisher = Publisher::new(bus.clone());

        Self {
            config,
            store,
            regime,
            price_engine,
            index_engine,
            bus,
            publisher,
            sessions,
            catalog,
            rng: Mutex::new(StdRng::from_entropy()),
            start_time: std::time::Instant::now(),
        }
    }

    /// Run exactly one tick: advance every instrument, recompute every
    /// index, commit atomically, then publish. A data invariant violation on
    /// any instrument aborts the whole tick — no partial snapshot is ever
    /// committed or published. Every other failure is logged and the
    /// simulation proceeds on the next tick.
    pub async fn run_tick(&self) {
        if self.catalog.instruments.is_empty() {
            return;
        }

        let regime = self.regime.current();
        let previous_snapshots = match self.store.snapshot_read_all().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "snapshot read failed, skipping tick");
                return;
            }
        };
        let mut previous_by_symbol: HashMap<String, _> =
            previous_snapshots.into_iter().map(|s| (s.symbol.clone(), s)).collect();

        let shocks = {
            let mut rng = self.rng.lock();
            self.price_engine.draw_shared_shocks(&mut *rng)
        };

        let mut fresh_snapshots = Vec::with_capacity(self.catalog.instruments.len());
        let mut stock_bars = Vec::with_capacity(self.catalog.instruments.len());
        let mut opens: Vec<(String, f64, f64, f64, f64)> = Vec::with_capacity(self.catalog.instruments.len());
        let mut prices: HashMap<String, f64> = HashMap::with_capacity(self.catalog.instruments.len());

        for instrument in &self.catalog.instruments {
            let Some(previous) = previous_by_symbol.remove(&instrument.symbol) else {
                warn!(symbol = %instrument.symbol, "instrument has no snapshot row, skipping");
                continue;
            };
            if previous.previous_close <= 0.0 || previous.price <= 0.0 {
                warn!(symbol = %instrument.symbol, "instrument snapshot not yet seeded with a positive price, skipping");
                continue;
            }

            let sector_beta = self
                .catalog
                .sectors
                .get(&instrument.sector_code)
                .map(|s| s.beta_sector)
                .unwrap_or(1.0);

            let quote = {
                let mut rng = self.rng.lock();
                self.price_engine.advance_instrument(instrument, sector_beta, &previous, &regime, shocks, &mut *rng)
            };

            match quote {
                Ok(quote) => {
                    prices.insert(instrument.symbol.clone(), quote.snapshot.price);
                    opens.push((
                        instrument.symbol.clone(),
                        quote.bar.open,
                        quote.bar.high,
                        quote.bar.low,
                        quote.bar.volume,
                    ));
                    fresh_snapshots.push(quote.snapshot);
                    stock_bars.push(quote.bar);
                }
                Err(err) => {
                    error!(symbol = %instrument.symbol, error = %err, "tick aborted: data invariant violated");
                    return;
                }
            }
        }

        if fresh_snapshots.is_empty() {
            return;
        }

        let index_results = self.index_engine.recompute_all(
            &self.catalog.indices,
            &self.catalog.constituents_by_index,
            &prices,
        );
        let index_snapshots: Vec<_> = index_results.iter().map(|(s, _)| s.clone()).collect();
        let index_bars: Vec<Bar> = index_results.into_iter().map(|(_, b)| b).collect();

        let commit = TickCommit {
            instruments: fresh_snapshots.clone(),
            indices: index_snapshots.clone(),
            bars: stock_bars.into_iter().chain(index_bars).collect(),
        };

        if let Err(err) = self.store.commit_tick(commit).await {
            warn!(error = %err, "tick commit failed, skipping publish for this tick");
            return;
        }

        self.publisher.publish_stocks(&fresh_snapshots, &opens).await;
        self.publisher.publish_indices(&index_snapshots).await;
    }

    pub fn connected_session_count(&self) -> usize {
        self.sessions.connected_session_count()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
