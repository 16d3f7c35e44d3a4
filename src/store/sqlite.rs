// =============================================================================
// SqliteStore — rusqlite-backed implementation of the `Store` trait
// =============================================================================
//
// Grounded on the single-writer-task pattern: one task owns the connection
// and drains a command channel; writes are serialized through it so a
// tick's snapshot + history writes commit as one SQLite transaction. Reads
// lock the shared connection directly from the calling task — cheap under
// WAL mode, where readers never block on the writer.
// =============================================================================

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::error::{EngineError, EngineResult};
use crate::store::{MarketRegimeRow, Store, TickCommit};
use crate::types::{
    Bar, CalculationMethod, Index, IndexConstituent, IndexSnapshot, Instrument, InstrumentSnapshot,
    MarketRegime, Sector, TargetType,
};

pub type DbPool = Arc<Mutex<Connection>>;

/// Open (or create) the sqlite database at `path`, apply pragmas and the
/// embedded schema, and return the shared connection handle.
pub fn init_db(path: &str) -> EngineResult<DbPool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Database(format!("create dir: {e}")))?;
        }
    }

    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    conn.execute_batch(include_str!("schema.sql"))?;

    tracing::info!(path = %path, "store initialized");
    Ok(Arc::new(Mutex::new(conn)))
}

enum StoreCommand {
    CommitTick {
        commit: TickCommit,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    RecordRegimeTransition {
        regime: MarketRegime,
        start_time: i64,
        daily_drift: f64,
        volatility_multiplier: f64,
        reply: oneshot::Sender<EngineResult<MarketRegimeRow>>,
    },
}

#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
    cmd_tx: mpsc::Sender<StoreCommand>,
}

impl SqliteStore {
    /// Construct the store and spawn its writer task on the current tokio
    /// runtime. Returns the handle used by the rest of the engine.
    pub fn spawn(db: DbPool) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<StoreCommand>(256);
        let writer_db = db.clone();

        tokio::spawn(async move {
            tracing::info!("store writer task started");
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    StoreCommand::CommitTick { commit, reply } => {
                        let result = execute_commit_tick(&writer_db, commit);
                        let _ = reply.send(result);
                    }
                    StoreCommand::RecordRegimeTransition {
                        regime,
                        start_time,
                        daily_drift,
                        volatility_multiplier,
                        reply,
                    } => {
                        let result = execute_regime_transition(
                            &writer_db,
                            regime,
                            start_time,
                            daily_drift,
                            volatility_multiplier,
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("store writer task shutting down");
        });

        Self { db, cmd_tx }
    }
}

fn execute_commit_tick(db: &DbPool, commit: TickCommit) -> EngineResult<()> {
    let mut conn = db.lock().map_err(|e| EngineError::Database(format!("lock poisoned: {e}")))?;
    let tx = conn.transaction()?;

    for inst in &commit.instruments {
        tx.execute(
            "UPDATE stocks SET price = ?1, previous_close = ?2, change_value = ?3, change_pct = ?4, updated_at = ?5 WHERE symbol = ?6",
            rusqlite::params![inst.price, inst.previous_close, inst.change_value, inst.change_pct, inst.updated_at, inst.symbol],
        )?;
    }

    for idx in &commit.indices {
        tx.execute(
            "UPDATE indices SET current_value = ?1, previous_close = ?2, updated_at = ?3 WHERE code = ?4",
            rusqlite::params![idx.current_value, idx.previous_close, chrono::Utc::now().timestamp(), idx.code],
        )?;
    }

    for bar in &commit.bars {
        tx.execute(
            "INSERT OR REPLACE INTO price_data
                (target_type, target_code, interval, timestamp, datetime, open, high, low, close, volume, turnover, change_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                bar.target_type.to_string(),
                bar.target_code,
                bar.interval,
                bar.timestamp_start,
                chrono::DateTime::from_timestamp(bar.timestamp_start, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
                bar.turnover,
                bar.change_pct,
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

fn execute_regime_transition(
    db: &DbPool,
    regime: MarketRegime,
    start_time: i64,
    daily_drift: f64,
    volatility_multiplier: f64,
) -> EngineResult<MarketRegimeRow> {
    let mut conn = db.lock().map_err(|e| EngineError::Database(format!("lock poisoned: {e}")))?;
    let tx = conn.transaction()?;

    tx.execute(
        "UPDATE market_states SET end_time = ?1, is_current = 0 WHERE is_current = 1",
        rusqlite::params![start_time],
    )?;

    tx.execute(
        "INSERT INTO market_states (regime, start_time, end_time, daily_drift, volatility_multiplier, is_current)
         VALUES (?1, ?2, NULL, ?3, ?4, 1)",
        rusqlite::params![regime.to_string(), start_time, daily_drift, volatility_multiplier],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    Ok(MarketRegimeRow {
        id,
        regime,
        start_time,
        end_time: None,
        daily_drift,
        volatility_multiplier,
        is_current: true,
    })
}

fn parse_regime(s: &str) -> MarketRegime {
    match s {
        "BULL" => MarketRegime::Bull,
        "BEAR" => MarketRegime::Bear,
        _ => MarketRegime::Sideways,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn snapshot_read_all(&self) -> EngineResult<Vec<InstrumentSnapshot>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare(
            "SELECT symbol, name, price, previous_close, change_value, change_pct, updated_at FROM stocks",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(InstrumentSnapshot {
                symbol: row.get(0)?,
                name: row.get(1)?,
                price: row.get(2)?,
                previous_close: row.get(3)?,
                change_value: row.get(4)?,
                change_pct: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn snapshot_read_all_indices(&self) -> EngineResult<Vec<IndexSnapshot>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare(
            "SELECT code, name, current_value, previous_close FROM indices",
        )?;
        let rows = stmt.query_map([], |row| {
            let current_value: f64 = row.get(2)?;
            let previous_close: f64 = row.get(3)?;
            Ok(IndexSnapshot {
                code: row.get(0)?,
                name: row.get(1)?,
                current_value,
                previous_close,
                change_value: current_value - previous_close,
                change_pct: if previous_close > 0.0 {
                    100.0 * (current_value / previous_close - 1.0)
                } else {
                    0.0
                },
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn commit_tick(&self, commit: TickCommit) -> EngineResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::CommitTick { commit, reply: reply_tx })
            .await
            .map_err(|e| EngineError::ChannelClosed(e.to_string()))?;
        reply_rx
            .await
            .map_err(|e| EngineError::ChannelClosed(e.to_string()))?
    }

    async fn history_last_n(
        &self,
        target_type: &str,
        target_code: &str,
        interval: &str,
        limit: usize,
    ) -> EngineResult<Vec<Bar>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare(
            "SELECT target_type, target_code, interval, timestamp, open, high, low, close, volume, turnover, change_pct
             FROM price_data WHERE target_type = ?1 AND target_code = ?2 AND interval = ?3
             ORDER BY timestamp DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![target_type, target_code, interval, limit as i64],
            map_bar_row,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn history_range(
        &self,
        target_type: &str,
        target_code: &str,
        interval: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> EngineResult<Vec<Bar>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare(
            "SELECT target_type, target_code, interval, timestamp, open, high, low, close, volume, turnover, change_pct
             FROM price_data WHERE target_type = ?1 AND target_code = ?2 AND interval = ?3 AND timestamp BETWEEN ?4 AND ?5
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![target_type, target_code, interval, from_ts, to_ts],
            map_bar_row,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn current_regime(&self) -> EngineResult<Option<MarketRegimeRow>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare(
            "SELECT id, regime, start_time, end_time, daily_drift, volatility_multiplier, is_current
             FROM market_states WHERE is_current = 1 LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], |row| {
            let regime_str: String = row.get(1)?;
            Ok(MarketRegimeRow {
                id: row.get(0)?,
                regime: parse_regime(&regime_str),
                start_time: row.get(2)?,
                end_time: row.get(3)?,
                daily_drift: row.get(4)?,
                volatility_multiplier: row.get(5)?,
                is_current: row.get::<_, i64>(6)? != 0,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    async fn record_regime_transition(
        &self,
        regime: MarketRegime,
        start_time: i64,
        daily_drift: f64,
        volatility_multiplier: f64,
    ) -> EngineResult<MarketRegimeRow> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::RecordRegimeTransition {
                regime,
                start_time,
                daily_drift,
                volatility_multiplier,
                reply: reply_tx,
            })
            .await
            .map_err(|e| EngineError::ChannelClosed(e.to_string()))?;
        reply_rx
            .await
            .map_err(|e| EngineError::ChannelClosed(e.to_string()))?
    }

    async fn load_instruments(&self) -> EngineResult<Vec<Instrument>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare(
            "SELECT s.symbol, s.name, s.sector_code, m.market_cap, m.beta_market, m.sigma_annual
             FROM stocks s JOIN stock_metadata m ON m.symbol = s.symbol",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Instrument {
                symbol: row.get(0)?,
                name: row.get(1)?,
                sector_code: row.get(2)?,
                market_cap: row.get(3)?,
                beta_market: row.get(4)?,
                sigma_annual: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn load_sectors(&self) -> EngineResult<Vec<Sector>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare("SELECT code, name, beta_sector FROM sectors")?;
        let rows = stmt.query_map([], |row| {
            Ok(Sector { code: row.get(0)?, name: row.get(1)?, beta_sector: row.get(2)? })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn load_indices(&self) -> EngineResult<Vec<Index>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt = conn.prepare(
            "SELECT code, name, base_value, calculation_method, current_value, previous_close FROM indices",
        )?;
        let rows = stmt.query_map([], |row| {
            let method_str: String = row.get(3)?;
            Ok(Index {
                code: row.get(0)?,
                name: row.get(1)?,
                base_value: row.get(2)?,
                calculation_method: if method_str == "equal_weighted" {
                    CalculationMethod::EqualWeighted
                } else {
                    CalculationMethod::CapWeighted
                },
                current_value: row.get(4)?,
                previous_close: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn load_index_constituents(&self) -> EngineResult<Vec<IndexConstituent>> {
        let conn = self.db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
        let mut stmt =
            conn.prepare("SELECT index_code, symbol, weight, is_active FROM index_constituents")?;
        let rows = stmt.query_map([], |row| {
            Ok(IndexConstituent {
                index_code: row.get(0)?,
                symbol: row.get(1)?,
                weight: row.get(2)?,
                is_active: row.get::<_, i64>(3)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn map_bar_row(row: &rusqlite::Row) -> rusqlite::Result<Bar> {
    let target_type_str: String = row.get(0)?;
    Ok(Bar {
        target_type: if target_type_str == "INDEX" { TargetType::Index } else { TargetType::Stock },
        target_code: row.get(1)?,
        interval: row.get(2)?,
        timestamp_start: row.get(3)?,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        volume: row.get(8)?,
        turnover: row.get(9)?,
        change_pct: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("aurora-store-test-{tag}-{}.db", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    fn seed_one_stock(db: &DbPool, symbol: &str) {
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT INTO stocks (symbol, name, sector_code, price, previous_close, updated_at) VALUES (?1, ?2, 'TECH', 100.0, 100.0, 0)",
            rusqlite::params![symbol, format!("{symbol} Inc")],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn commit_tick_is_atomic_and_visible_to_reads() {
        let path = temp_db_path("commit");
        let db = init_db(&path).unwrap();
        seed_one_stock(&db, "AAA");
        let store = SqliteStore::spawn(db);

        let commit = TickCommit {
            instruments: vec![InstrumentSnapshot {
                symbol: "AAA".into(),
                name: "AAA Inc".into(),
                price: 101.5,
                previous_close: 100.0,
                change_value: 1.5,
                change_pct: 1.5,
                updated_at: 1000,
            }],
            indices: vec![],
            bars: vec![Bar {
                target_type: TargetType::Stock,
                target_code: "AAA".into(),
                interval: "tick".into(),
                timestamp_start: 1000,
                open: 100.0,
                high: 101.5,
                low: 99.8,
                close: 101.5,
                volume: 12000.0,
                turnover: 101.5 * 12000.0,
                change_pct: 1.5,
            }],
        };
        store.commit_tick(commit).await.unwrap();

        let snapshot = store.snapshot_read_all().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!((snapshot[0].price - 101.5).abs() < 1e-9);

        let bars = store.history_last_n("STOCK", "AAA", "tick", 10).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert!((bars[0].close - 101.5).abs() < 1e-9);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn regime_transition_keeps_exactly_one_current_row() {
        let path = temp_db_path("regime");
        let db = init_db(&path).unwrap();
        let store = SqliteStore::spawn(db);

        store
            .record_regime_transition(MarketRegime::Bull, 0, 0.005, 1.2)
            .await
            .unwrap();
        store
            .record_regime_transition(MarketRegime::Bear, 86_400, -0.005, 1.5)
            .await
            .unwrap();

        let current = store.current_regime().await.unwrap().expect("current regime");
        assert_eq!(current.regime, MarketRegime::Bear);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn load_instruments_joins_static_tables() {
        let path = temp_db_path("catalog");
        let db = init_db(&path).unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO stocks (symbol, name, sector_code, price, previous_close, updated_at) VALUES ('AAA', 'AAA Inc', 'TECH', 100.0, 100.0, 0)",
                [],
            ).unwrap();
            conn.execute(
                "INSERT INTO stock_metadata (symbol, market_cap, beta_market, sigma_annual) VALUES ('AAA', 1000000, 1.1, 0.3)",
                [],
            ).unwrap();
            conn.execute(
                "INSERT INTO sectors (code, name, beta_sector) VALUES ('TECH', 'Technology', 1.05)",
                [],
            ).unwrap();
        }
        let store = SqliteStore::spawn(db);

        let instruments = store.load_instruments().await.unwrap();
        assert_eq!(instruments.len(), 1);
        assert_eq!(instruments[0].symbol, "AAA");
        assert!((instruments[0].beta_market - 1.1).abs() < 1e-9);

        let sectors = store.load_sectors().await.unwrap();
        assert_eq!(sectors.len(), 1);
        assert_eq!(sectors[0].code, "TECH");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn empty_store_has_empty_catalog() {
        let path = temp_db_path("empty-catalog");
        let db = init_db(&path).unwrap();
        let store = SqliteStore::spawn(db);

        assert!(store.load_instruments().await.unwrap().is_empty());
        assert!(store.load_indices().await.unwrap().is_empty());
        assert!(store.load_index_constituents().await.unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }
}
