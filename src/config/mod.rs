//! Configuration management for CascadeBot
//!
//! Loads compiled defaults, then `config/default` and `config/local`, then
//! `CASCADEBOT__*` environment variables (after reading `.env`).

mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub cascade: CascadeCfg,
    pub adaptive: AdaptiveCfg,
    pub selector: SelectorCfg,
    pub risk: RiskCfg,
    pub ledger: LedgerCfg,
    pub persistence: PersistenceConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Version tag for logging and CSV
    pub tag: String,
    /// Producers to register (by name); empty means all built-ins
    pub producers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeCfg {
    /// Multiplier applied to the cascade threshold after an empty sweep (< 1.0)
    pub threshold_decay: f64,
    /// Loosened sweeps allowed after the first one
    pub max_retries: u32,
    /// Per-producer timeout in milliseconds
    pub producer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveCfg {
    /// Trades required before a strategy's multiplier moves
    pub min_trades: usize,
    /// Trades required since the last adjustment
    pub adjust_every: usize,
    /// Trailing window used to classify performance
    pub lookback: usize,
    /// Average pnl (USD) below which a strategy is tightened
    pub bad_avg_pnl: f64,
    /// Hours without any trade before emergency loosening
    pub emergency_hours: f64,
    /// Loosening per hour over the emergency threshold
    pub emergency_step: f64,
    /// Lowest emergency multiplier
    pub emergency_floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorCfg {
    pub min_confidence: f64,
    pub max_signals_per_scan: usize,
    pub max_correlated_exposure_usd: f64,
    pub diversification_bonus: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCfg {
    /// Absolute per-position cap (USD)
    pub max_position_usd: f64,
    /// Smallest tradable size (USD)
    pub min_position_usd: f64,
    /// Daily loss that trips the kill switch (USD)
    pub max_daily_loss_usd: f64,
    pub max_open_positions: usize,
    pub max_hourly_trades: usize,
    /// Consecutive losses that pause trading
    pub loss_streak_limit: u32,
    pub pause_minutes: i64,
    /// Open positions allowed per correlation key
    pub max_positions_per_key: usize,
    /// Confidence floor at admission
    pub min_confidence: f64,
    /// Fraction of the daily loss limit that raises a warning
    pub daily_loss_warning_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCfg {
    /// "standard" or "aggressive"
    pub profile: String,
    pub starting_balance: f64,
    pub slippage_base: f64,
    pub slippage_size_factor: f64,
    /// Overrides on top of the profile
    #[serde(default)]
    pub min_trade_usd: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub trailing_activation_pct: Option<f64>,
    #[serde(default)]
    pub trailing_stop_pct: Option<f64>,
    #[serde(default)]
    pub max_hold_minutes: Option<i64>,
    #[serde(default)]
    pub pyramid_enabled: Option<bool>,
    #[serde(default)]
    pub pyramid_trigger_pct: Option<f64>,
    #[serde(default)]
    pub pyramid_size_pct: Option<f64>,
    #[serde(default)]
    pub pyramid_max_levels: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Enable CSV trade store (falls back to memory when false or unavailable)
    pub csv_enabled: bool,
    /// Ledger state file (JSON), relative to data_dir
    pub state_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Decision loop interval in seconds
    pub scan_interval_secs: u64,
    /// Mark (price) loop interval in seconds
    pub mark_interval_secs: u64,
    /// Hours between summary alerts
    pub summary_interval_hours: u64,
    /// JSON file the market feed reads
    pub feed_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder_with_defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CASCADEBOT__*)
            .add_source(Environment::with_prefix("CASCADEBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Compiled defaults only (no files, no environment)
    pub fn defaults() -> Result<Self> {
        Self::builder_with_defaults()?
            .build()
            .context("Failed to build default configuration")?
            .try_deserialize()
            .context("Failed to deserialize default configuration")
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.producers", Vec::<String>::new())?
            // Cascade defaults
            .set_default("cascade.threshold_decay", 0.8)?
            .set_default("cascade.max_retries", 3)?
            .set_default("cascade.producer_timeout_ms", 5000)?
            // Adaptive defaults
            .set_default("adaptive.min_trades", 10)?
            .set_default("adaptive.adjust_every", 5)?
            .set_default("adaptive.lookback", 50)?
            .set_default("adaptive.bad_avg_pnl", -1.0)?
            .set_default("adaptive.emergency_hours", 6.0)?
            .set_default("adaptive.emergency_step", 0.05)?
            .set_default("adaptive.emergency_floor", 0.5)?
            // Selector defaults
            .set_default("selector.min_confidence", 0.6)?
            .set_default("selector.max_signals_per_scan", 5)?
            .set_default("selector.max_correlated_exposure_usd", 100.0)?
            .set_default("selector.diversification_bonus", 0.1)?
            // Risk defaults
            .set_default("risk.max_position_usd", 50.0)?
            .set_default("risk.min_position_usd", 1.0)?
            .set_default("risk.max_daily_loss_usd", 100.0)?
            .set_default("risk.max_open_positions", 10)?
            .set_default("risk.max_hourly_trades", 20)?
            .set_default("risk.loss_streak_limit", 5)?
            .set_default("risk.pause_minutes", 60)?
            .set_default("risk.max_positions_per_key", 2)?
            .set_default("risk.min_confidence", 0.5)?
            .set_default("risk.daily_loss_warning_ratio", 0.8)?
            // Ledger defaults
            .set_default("ledger.profile", "standard")?
            .set_default("ledger.starting_balance", 1000.0)?
            .set_default("ledger.slippage_base", 0.001)?
            .set_default("ledger.slippage_size_factor", 0.004)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            .set_default("persistence.state_file", "ledger_state.json")?
            // Engine defaults
            .set_default("engine.scan_interval_secs", 30)?
            .set_default("engine.mark_interval_secs", 5)?
            .set_default("engine.summary_interval_hours", 4)?
            .set_default("engine.feed_path", "./data/markets.json")?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;
        Ok(builder)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.engine.scan_interval_secs.max(1))
    }

    pub fn mark_interval(&self) -> Duration {
        Duration::from_secs(self.engine.mark_interval_secs.max(1))
    }

    /// Effective configuration as YAML (no secrets are held in config)
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render configuration as YAML")
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} profile={} retries={} decay={:.2} min_conf={:.2} max_pos=${:.0} max_daily_loss=${:.0} scan={}s",
            self.bot.tag,
            self.ledger.profile,
            self.cascade.max_retries,
            self.cascade.threshold_decay,
            self.selector.min_confidence,
            self.risk.max_position_usd,
            self.risk.max_daily_loss_usd,
            self.engine.scan_interval_secs
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

// ─────────────────────────────────────────────────────────────────
// Section → runtime config
// ─────────────────────────────────────────────────────────────────

impl From<&AppConfig> for CascadeConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            threshold_decay: cfg.cascade.threshold_decay.clamp(0.01, 0.99),
            max_retries: cfg.cascade.max_retries,
            producer_timeout: Duration::from_millis(cfg.cascade.producer_timeout_ms),
        }
    }
}

impl From<&AppConfig> for AdaptiveConfig {
    fn from(cfg: &AppConfig) -> Self {
        let a = &cfg.adaptive;
        Self {
            min_trades: a.min_trades,
            adjust_every: a.adjust_every.max(1),
            lookback: a.lookback.max(1),
            bad_avg_pnl: a.bad_avg_pnl,
            emergency_hours: a.emergency_hours,
            emergency_step: a.emergency_step,
            emergency_floor: a.emergency_floor,
        }
    }
}

impl From<&AppConfig> for SelectorConfig {
    fn from(cfg: &AppConfig) -> Self {
        let s = &cfg.selector;
        Self {
            min_confidence: s.min_confidence,
            max_signals_per_scan: s.max_signals_per_scan,
            max_correlated_exposure_usd: s.max_correlated_exposure_usd,
            diversification_bonus: s.diversification_bonus,
        }
    }
}

impl From<&AppConfig> for RiskConfig {
    fn from(cfg: &AppConfig) -> Self {
        let r = &cfg.risk;
        // Never size below what the ledger will accept
        let ledger_min = LedgerConfig::from(cfg).min_trade_usd;
        Self {
            max_position_usd: r.max_position_usd,
            min_position_usd: r.min_position_usd.max(ledger_min),
            max_daily_loss_usd: r.max_daily_loss_usd,
            max_open_positions: r.max_open_positions,
            max_hourly_trades: r.max_hourly_trades,
            loss_streak_limit: r.loss_streak_limit,
            pause_duration: chrono::Duration::minutes(r.pause_minutes),
            max_positions_per_key: r.max_positions_per_key,
            min_confidence: r.min_confidence,
            daily_loss_warning_ratio: r.daily_loss_warning_ratio,
        }
    }
}

impl From<&AppConfig> for LedgerConfig {
    fn from(cfg: &AppConfig) -> Self {
        let l = &cfg.ledger;
        let mut out = match l.profile.to_ascii_lowercase().as_str() {
            "aggressive" => LedgerConfig::aggressive(),
            _ => LedgerConfig::default(),
        };
        out.starting_balance = l.starting_balance;
        out.slippage_base = l.slippage_base;
        out.slippage_size_factor = l.slippage_size_factor;
        out.max_position_usd = cfg.risk.max_position_usd;
        out.max_correlated_exposure_usd = cfg.selector.max_correlated_exposure_usd;
        if let Some(v) = l.min_trade_usd {
            out.min_trade_usd = v;
        }
        if let Some(v) = l.take_profit_pct {
            out.take_profit_pct = v;
        }
        if let Some(v) = l.stop_loss_pct {
            out.stop_loss_pct = v;
        }
        if let Some(v) = l.trailing_activation_pct {
            out.trailing_activation_pct = v;
        }
        if let Some(v) = l.trailing_stop_pct {
            out.trailing_stop_pct = v;
        }
        if let Some(v) = l.max_hold_minutes {
            out.max_hold = chrono::Duration::minutes(v);
        }
        if let Some(v) = l.pyramid_enabled {
            out.pyramid.enabled = v;
        }
        if let Some(v) = l.pyramid_trigger_pct {
            out.pyramid.trigger_pct = v;
        }
        if let Some(v) = l.pyramid_size_pct {
            out.pyramid.size_pct = v;
        }
        if let Some(v) = l.pyramid_max_levels {
            out.pyramid.max_levels = v;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_runtime_defaults() {
        let cfg = AppConfig::defaults().unwrap();
        let risk = RiskConfig::from(&cfg);
        let expected = RiskConfig::default();
        assert_eq!(risk.max_daily_loss_usd, expected.max_daily_loss_usd);
        assert_eq!(risk.max_open_positions, expected.max_open_positions);
        assert_eq!(risk.loss_streak_limit, expected.loss_streak_limit);

        let cascade = CascadeConfig::from(&cfg);
        assert_eq!(cascade.max_retries, 3);
        assert!((cascade.threshold_decay - 0.8).abs() < 1e-9);

        let selector = SelectorConfig::from(&cfg);
        assert_eq!(selector.max_signals_per_scan, 5);
    }

    #[test]
    fn aggressive_profile_enables_pyramiding_with_overrides() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.ledger.profile = "aggressive".into();
        cfg.ledger.take_profit_pct = Some(35.0);

        let ledger = LedgerConfig::from(&cfg);
        assert!(ledger.pyramid.enabled);
        assert_eq!(ledger.take_profit_pct, 35.0);
        assert_eq!(ledger.stop_loss_pct, 15.0);
        assert_eq!(ledger.max_position_usd, cfg.risk.max_position_usd);
    }

    #[test]
    fn risk_minimum_follows_ledger_minimum() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.ledger.profile = "aggressive".into();

        let ledger = LedgerConfig::from(&cfg);
        let risk = RiskConfig::from(&cfg);
        assert_eq!(ledger.min_trade_usd, 10.0);
        assert_eq!(risk.min_position_usd, ledger.min_trade_usd);

        // A weak signal sizes up to the ledger minimum instead of being refused
        let market = crate::types::MarketSnapshot {
            market_id: "m1".into(),
            sport: "nba".into(),
            current_price: 0.8,
            ..Default::default()
        };
        let signal = crate::types::Signal::new(
            "market_only",
            &market,
            crate::types::Direction::BuyNo,
            0.8,
            0.78,
            0.82,
            0.6,
            12.0,
            "weak",
        );
        let gate = crate::risk::RiskGate::new(risk);
        let size = gate.size_for(&signal);
        assert!((size - 10.0).abs() < 1e-9, "Expected 10.0, got {}", size);

        let book = crate::paper_trading::PositionLedger::new(ledger);
        let opened = book.open(&signal, size, chrono::Utc::now()).unwrap();
        assert!((opened.size - 10.0).abs() < 1e-9);
    }

    #[test]
    fn pyramid_values_can_be_overridden() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.ledger.profile = "aggressive".into();
        cfg.ledger.pyramid_trigger_pct = Some(5.0);
        cfg.ledger.pyramid_size_pct = Some(25.0);
        cfg.ledger.pyramid_max_levels = Some(1);

        let pyramid = LedgerConfig::from(&cfg).pyramid;
        assert!(pyramid.enabled);
        assert_eq!(pyramid.trigger_pct, 5.0);
        assert_eq!(pyramid.size_pct, 25.0);
        assert_eq!(pyramid.max_levels, 1);
    }

    #[test]
    fn digest_mentions_profile_and_limits() {
        let cfg = AppConfig::defaults().unwrap();
        let digest = cfg.to_string();
        assert!(digest.contains("profile=standard"));
        assert!(digest.contains("max_daily_loss=$100"));
        assert!(cfg.to_yaml().unwrap().contains("threshold_decay"));
    }
}
