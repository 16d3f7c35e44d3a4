// =============================================================================
// Runtime Configuration — every tunable the simulation exposes
// =============================================================================
//
// All fields carry `#[serde(default = "...")]` so a config file written by an
// older version of this binary keeps loading after new fields are added.
// Persistence uses an atomic tmp + rename pattern to avoid corruption on a
// crash mid-write.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_tick_interval_secs() -> f64 {
    3.0
}

fn default_steps_per_day() -> u32 {
    4800
}

fn default_trading_days_per_year() -> u32 {
    250
}

fn default_price_limit_pct() -> f64 {
    0.10
}

fn default_weights_msi() -> (f64, f64, f64) {
    (0.50, 0.30, 0.20)
}

fn default_rho_ms() -> f64 {
    0.75
}

fn default_sigma_market_annual() -> f64 {
    0.18
}

fn default_sigma_sector_annual() -> f64 {
    0.22
}

fn default_sigma_individual_annual() -> f64 {
    0.35
}

fn default_regime_min_dwell_days() -> u32 {
    7
}

fn default_heartbeat_seconds() -> u64 {
    30
}

fn default_index_scale_k() -> f64 {
    10.0
}

fn default_database_path() -> String {
    "./aurora_market.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

/// All engine-wide tunables, enumerated in full in the system design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Seconds between ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: f64,

    /// Simulated steps in one trading day (dt = 1 / steps_per_day).
    #[serde(default = "default_steps_per_day")]
    pub steps_per_day: u32,

    #[serde(default = "default_trading_days_per_year")]
    pub trading_days_per_year: u32,

    /// Daily price band, e.g. 0.10 = +/-10%.
    #[serde(default = "default_price_limit_pct")]
    pub price_limit_pct: f64,

    /// (market, sector, idiosyncratic) composite weights. Must sum to 1.0.
    #[serde(default = "default_weights_msi")]
    pub weights_msi: (f64, f64, f64),

    /// Correlation between market and sector shocks.
    #[serde(default = "default_rho_ms")]
    pub rho_ms: f64,

    #[serde(default = "default_sigma_market_annual")]
    pub sigma_market_annual: f64,

    #[serde(default = "default_sigma_sector_annual")]
    pub sigma_sector_annual: f64,

    #[serde(default = "default_sigma_individual_annual")]
    pub sigma_individual_annual: f64,

    #[serde(default = "default_regime_min_dwell_days")]
    pub regime_min_dwell_days: u32,

    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,

    /// Index scaling factor K (see IndexEngine).
    #[serde(default = "default_index_scale_k")]
    pub index_scale_k: f64,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            steps_per_day: default_steps_per_day(),
            trading_days_per_year: default_trading_days_per_year(),
            price_limit_pct: default_price_limit_pct(),
            weights_msi: default_weights_msi(),
            rho_ms: default_rho_ms(),
            sigma_market_annual: default_sigma_market_annual(),
            sigma_sector_annual: default_sigma_sector_annual(),
            sigma_individual_annual: default_sigma_individual_annual(),
            regime_min_dwell_days: default_regime_min_dwell_days(),
            heartbeat_seconds: default_heartbeat_seconds(),
            index_scale_k: default_index_scale_k(),
            database_path: default_database_path(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist or fails to parse, returns an error so the
    /// caller can fall back to defaults with a warning — the engine never
    /// refuses to start over a missing config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// `1 / steps_per_day`, the per-tick time step used by PriceEngine.
    pub fn dt(&self) -> f64 {
        1.0 / self.steps_per_day as f64
    }

    /// Apply environment-variable overrides on top of whatever was loaded
    /// from disk (or defaulted). Every field enumerated in the system design
    /// is overridable; an env var that fails to parse is logged and ignored
    /// rather than treated as fatal, consistent with "never refuses to
    /// start" — only `load`'s own file-not-found/parse-error path returns
    /// `Err`.
    pub fn apply_env_overrides(&mut self) {
        env_override("TICK_INTERVAL", &mut self.tick_interval_secs);
        env_override("STEPS_PER_DAY", &mut self.steps_per_day);
        env_override("TRADING_DAYS_PER_YEAR", &mut self.trading_days_per_year);
        env_override("PRICE_LIMIT_PCT", &mut self.price_limit_pct);
        env_override("RHO_MS", &mut self.rho_ms);
        env_override("SIGMA_MARKET_ANNUAL", &mut self.sigma_market_annual);
        env_override("SIGMA_SECTOR_ANNUAL", &mut self.sigma_sector_annual);
        env_override("SIGMA_INDIVIDUAL_ANNUAL", &mut self.sigma_individual_annual);
        env_override("REGIME_MIN_DWELL_DAYS", &mut self.regime_min_dwell_days);
        env_override("HEARTBEAT_SECONDS", &mut self.heartbeat_seconds);
        env_override("INDEX_SCALE_K", &mut self.index_scale_k);
        env_override_string("DATABASE_PATH", &mut self.database_path);
        env_override_string("BIND_ADDR", &mut self.bind_addr);

        if let Ok(raw) = std::env::var("WEIGHTS_MSI") {
            match parse_weights_msi(&raw) {
                Some(weights) => self.weights_msi = weights,
                None => tracing::warn!(value = %raw, "WEIGHTS_MSI must be \"w_m,w_s,w_i\", ignoring"),
            }
        }
    }
}

/// Overwrite `*field` with `$KEY`'s value if set and parseable; log and
/// leave `*field` unchanged otherwise.
fn env_override<T: std::str::FromStr>(key: &str, field: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!(key, value = %raw, "failed to parse env override, ignoring"),
        }
    }
}

fn env_override_string(key: &str, field: &mut String) {
    if let Ok(raw) = std::env::var(key) {
        *field = raw;
    }
}

fn parse_weights_msi(raw: &str) -> Option<(f64, f64, f64)> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return None;
    }
    let w_m = parts[0].parse().ok()?;
    let w_s = parts[1].parse().ok()?;
    let w_i = parts[2].parse().ok()?;
    Some((w_m, w_s, w_i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.steps_per_day, 4800);
        assert_eq!(cfg.trading_days_per_year, 250);
        assert!((cfg.price_limit_pct - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.weights_msi, (0.50, 0.30, 0.20));
        assert!((cfg.rho_ms - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.regime_min_dwell_days, 7);
        assert_eq!(cfg.heartbeat_seconds, 30);
    }

    #[test]
    fn load_missing_file_errors_rather_than_panics() {
        let result = RuntimeConfig::load("/nonexistent/path/does-not-exist.json");
        assert!(result.is_err());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("aurora-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.tick_interval_secs = 1.5;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert!((loaded.tick_interval_secs - 1.5).abs() < f64::EPSILON);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn dt_is_inverse_of_steps_per_day() {
        let cfg = RuntimeConfig::default();
        assert!((cfg.dt() - 1.0 / 4800.0).abs() < 1e-12);
    }

    #[test]
    fn env_override_replaces_matching_field() {
        std::env::set_var("HEARTBEAT_SECONDS", "45");
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env_overrides();
        std::env::remove_var("HEARTBEAT_SECONDS");
        assert_eq!(cfg.heartbeat_seconds, 45);
    }

    #[test]
    fn env_override_ignores_unparseable_value() {
        std::env::set_var("REGIME_MIN_DWELL_DAYS", "not-a-number");
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env_overrides();
        std::env::remove_var("REGIME_MIN_DWELL_DAYS");
        assert_eq!(cfg.regime_min_dwell_days, 7);
    }

    #[test]
    fn weights_msi_env_override_parses_csv_triple() {
        std::env::set_var("WEIGHTS_MSI", "0.4,0.4,0.2");
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env_overrides();
        std::env::remove_var("WEIGHTS_MSI");
        assert_eq!(cfg.weights_msi, (0.4, 0.4, 0.2));
    }
}
