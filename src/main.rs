// =============================================================================
// Aurora Market — Main Entry Point
// =============================================================================
//
// Wires up the store, the regime controller, the in-process bus, the
// session hub and the tick scheduler, then serves the WebSocket surface.
// Regime transitions are not driven by the per-tick clock: a separate slow
// task attempts one roughly once per simulated trading day.
// =============================================================================

mod api;
mod app_state;
mod bus;
mod clock;
mod config;
mod error;
mod index_engine;
mod price;
mod publisher;
mod regime;
mod session;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, Catalog};
use crate::bus::InProcessBus;
use crate::clock::Scheduler;
use crate::config::RuntimeConfig;
use crate::regime::RegimeController;
use crate::session::SessionHub;
use crate::store::sqlite::{init_db, SqliteStore};

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-market starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    let db = init_db(&config.database_path)?;
    let store: Arc<dyn store::Store> = Arc::new(SqliteStore::spawn(db));

    let catalog = Catalog::load(store.as_ref()).await?;
    info!(
        instruments = catalog.instruments.len(),
        indices = catalog.indices.len(),
        "catalog loaded"
    );

    let regime = RegimeController::init(store.clone(), config.regime_min_dwell_days).await?;
    let bus = InProcessBus::new();
    let sessions = SessionHub::new(bus.clone(), config.heartbeat_seconds as i64);

    let state = Arc::new(AppState::new(config, store, regime, bus, sessions.clone(), catalog));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Tick scheduler — the single authority advancing simulated time.
    let tick_state = state.clone();
    let tick_shutdown = shutdown_rx.clone();
    let tick_handle = tokio::spawn(async move {
        let scheduler = Scheduler::new(Duration::from_secs_f64(tick_state.config.tick_interval_secs.max(0.01)));
        scheduler
            .run(tick_shutdown, |_n| {
                let state = tick_state.clone();
                async move { state.run_tick().await }
            })
            .await;
    });

    // Regime evaluation is a slow daily task, not driven by the tick clock.
    let regime_state = state.clone();
    let mut regime_shutdown = shutdown_rx.clone();
    let day_seconds = (state.config.tick_interval_secs * state.config.steps_per_day as f64).max(1.0);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs_f64(day_seconds));
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = regime_state.regime.transition(None).await {
                        warn!(error = %err, "regime transition attempt failed");
                    }
                }
                _ = regime_shutdown.changed() => {
                    if *regime_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Stale-session reaper.
    let reaper_sessions = sessions.clone();
    let reaper_interval = Duration::from_secs(state.config.heartbeat_seconds.max(1));
    let mut reaper_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => reaper_sessions.reap_stale_sessions(),
                _ = reaper_shutdown.changed() => {
                    if *reaper_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let app = Router::new()
        .route("/ws/market", get(api::ws::market_ws))
        .route("/ws/indices", get(api::ws::indices_ws))
        .route("/ws/stock/:symbol", get(api::ws::stock_ws))
        .route("/healthz", get(api::health::healthz))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let bind_addr = state.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");

    let server_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "http server exited with an error");
        }
    });

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(true);
    let _ = tick_handle.await;
    server_handle.abort();

    if let Err(err) = state.config.save(CONFIG_PATH) {
        error!(error = %err, "failed to save runtime config on shutdown");
    }

    info!("aurora-market shut down complete");
    Ok(())
}
