//! Core types used throughout the pipeline
//!
//! Defines market snapshots, signals, tiers and closed-trade records shared
//! by the cascade, selector, risk gate and ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProducerError;

/// Side of a binary prediction market, quoted in YES-price terms.
///
/// `BuyYes` profits when the YES price rises, `BuyNo` when it falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    BuyYes,
    BuyNo,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::BuyYes
    }
}

impl Direction {
    /// Unrealized return in percent for a move from `entry` to `current`.
    pub fn pnl_pct(&self, entry: f64, current: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        match self {
            Direction::BuyYes => (current - entry) / entry * 100.0,
            Direction::BuyNo => (entry - current) / entry * 100.0,
        }
    }

    /// True when `price` is more favorable than `reference` for this side.
    pub fn is_more_favorable(&self, price: f64, reference: f64) -> bool {
        match self {
            Direction::BuyYes => price > reference,
            Direction::BuyNo => price < reference,
        }
    }

    /// Percent drawdown of `current` from the high-water mark `hwm`.
    pub fn drawdown_pct(&self, hwm: f64, current: f64) -> f64 {
        if hwm <= 0.0 {
            return 0.0;
        }
        match self {
            Direction::BuyYes => (hwm - current) / hwm * 100.0,
            Direction::BuyNo => (current - hwm) / hwm * 100.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::BuyYes => write!(f, "BUY_YES"),
            Direction::BuyNo => write!(f, "BUY_NO"),
        }
    }
}

/// Priority tier a producer runs in. Lower ordinal runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyTier {
    Critical,
    High,
    Medium,
    Low,
}

impl StrategyTier {
    /// Sweep order.
    pub const ALL: [StrategyTier; 4] = [
        StrategyTier::Critical,
        StrategyTier::High,
        StrategyTier::Medium,
        StrategyTier::Low,
    ];

    /// Default tier for a strategy name.
    pub fn for_strategy(name: &str) -> Self {
        match name {
            "arbitrage" | "resolved" => StrategyTier::Critical,
            "overreaction" | "lag_arb" | "wicket_shock" => StrategyTier::High,
            "market_only" | "draw_decay" | "run_reversion" => StrategyTier::Medium,
            "volatility_scalp" | "favorite_trap" | "liquidity_provision" => StrategyTier::Low,
            _ => StrategyTier::Medium,
        }
    }
}

impl fmt::Display for StrategyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyTier::Critical => write!(f, "CRITICAL"),
            StrategyTier::High => write!(f, "HIGH"),
            StrategyTier::Medium => write!(f, "MEDIUM"),
            StrategyTier::Low => write!(f, "LOW"),
        }
    }
}

/// One market as seen by the feed at scan time.
///
/// Optional fields default so a sparse feed never breaks a producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub market_id: String,
    /// Parent event (match/game) the market belongs to, if known
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub sport: String,
    #[serde(default)]
    pub question: String,
    /// Current YES price (0.0 - 1.0)
    pub current_price: f64,
    #[serde(default)]
    pub previous_price: Option<f64>,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub spread: Option<f64>,
    #[serde(default)]
    pub volume: f64,
}

impl MarketSnapshot {
    /// Percent change from the previous price, 0 when unknown.
    pub fn price_change_pct(&self) -> f64 {
        match self.previous_price {
            Some(prev) if prev > 0.0 => (self.current_price - prev) / prev * 100.0,
            _ => 0.0,
        }
    }
}

/// Shared read-only context for one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanContext {
    pub taken_at: DateTime<Utc>,
    /// Recent game events (goals, wickets, injuries) keyed by nothing in particular
    #[serde(default)]
    pub recent_events: Vec<String>,
}

impl Default for ScanContext {
    fn default() -> Self {
        Self {
            taken_at: Utc::now(),
            recent_events: Vec::new(),
        }
    }
}

/// Live price update for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub market_id: String,
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Derive the correlation key: same event when known, else same sport and strategy.
pub fn correlation_key(event_id: Option<&str>, sport: &str, strategy_id: &str) -> String {
    match event_id {
        Some(event) if !event.is_empty() => format!("event:{}", event),
        _ => format!("sport:{}:{}", sport, strategy_id),
    }
}

/// Trading signal produced by a strategy. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub strategy_id: String,
    pub market_id: String,
    pub correlation_key: String,
    pub direction: Direction,
    /// Quoted YES price at signal time
    pub entry_price: f64,
    pub target_price: f64,
    pub stop_price: f64,
    /// Confidence level (0.0 - 1.0)
    pub confidence: f64,
    /// Requested size in USD before risk adjustment
    pub size_hint: f64,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Build a signal for `market`, deriving the correlation key.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy_id: &str,
        market: &MarketSnapshot,
        direction: Direction,
        entry_price: f64,
        target_price: f64,
        stop_price: f64,
        confidence: f64,
        size_hint: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: strategy_id.to_string(),
            market_id: market.market_id.clone(),
            correlation_key: correlation_key(market.event_id.as_deref(), &market.sport, strategy_id),
            direction,
            entry_price,
            target_price,
            stop_price,
            confidence,
            size_hint,
            rationale: rationale.into(),
            timestamp: Utc::now(),
        }
    }

    /// Validate at the producer boundary so the core never sees malformed input.
    /// Confidence is clamped into [0, 1].
    pub fn normalized(mut self) -> Result<Self, ProducerError> {
        if self.market_id.is_empty() {
            return Err(ProducerError::Malformed("empty market_id".into()));
        }
        if !self.entry_price.is_finite() || self.entry_price <= 0.0 || self.entry_price > 1.0 {
            return Err(ProducerError::Malformed(format!(
                "entry_price {} outside (0, 1]",
                self.entry_price
            )));
        }
        if !self.confidence.is_finite() || !self.size_hint.is_finite() || self.size_hint < 0.0 {
            return Err(ProducerError::Malformed(format!(
                "confidence {} / size_hint {} not usable",
                self.confidence, self.size_hint
            )));
        }
        self.confidence = self.confidence.clamp(0.0, 1.0);
        if self.correlation_key.is_empty() {
            self.correlation_key = format!("market:{}", self.market_id);
        }
        Ok(self)
    }
}

/// Why a position left the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    Timeout,
    SignalExit,
    ParentClosed,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TrailingStop => write!(f, "TRAILING_STOP"),
            ExitReason::Timeout => write!(f, "TIMEOUT"),
            ExitReason::SignalExit => write!(f, "SIGNAL_EXIT"),
            ExitReason::ParentClosed => write!(f, "PARENT_CLOSED"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Trade result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeResult {
    Win,
    Loss,
}

impl TradeResult {
    pub fn from_pnl(pnl: f64) -> Self {
        if pnl > 0.0 {
            TradeResult::Win
        } else {
            TradeResult::Loss
        }
    }
}

impl fmt::Display for TradeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeResult::Win => write!(f, "WIN"),
            TradeResult::Loss => write!(f, "LOSS"),
        }
    }
}

/// Closed trade emitted exactly once per settled position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: String,
    pub parent_id: Option<String>,
    pub pyramid_level: u32,
    pub strategy_id: String,
    pub market_id: String,
    pub correlation_key: String,
    pub direction: Direction,
    pub confidence: f64,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
    /// Human-readable exit detail, e.g. "Parent closed: TAKE_PROFIT"
    pub exit_detail: String,
    pub balance_after: f64,
}

impl ClosedTrade {
    pub fn result(&self) -> TradeResult {
        TradeResult::from_pnl(self.pnl)
    }

    pub fn hold_secs(&self) -> i64 {
        (self.closed_at - self.opened_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnl_pct_is_mirrored_for_buy_no() {
        assert!((Direction::BuyYes.pnl_pct(0.50, 0.60) - 20.0).abs() < 1e-9);
        assert!((Direction::BuyNo.pnl_pct(0.50, 0.40) - 20.0).abs() < 1e-9);
        assert!((Direction::BuyNo.pnl_pct(0.50, 0.60) + 20.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_measured_from_high_water_mark() {
        assert!((Direction::BuyYes.drawdown_pct(0.80, 0.72) - 10.0).abs() < 1e-9);
        assert!((Direction::BuyNo.drawdown_pct(0.40, 0.44) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn tier_mapping_defaults_to_medium() {
        assert_eq!(StrategyTier::for_strategy("arbitrage"), StrategyTier::Critical);
        assert_eq!(StrategyTier::for_strategy("overreaction"), StrategyTier::High);
        assert_eq!(StrategyTier::for_strategy("favorite_trap"), StrategyTier::Low);
        assert_eq!(StrategyTier::for_strategy("something_new"), StrategyTier::Medium);
    }

    #[test]
    fn correlation_key_prefers_event() {
        assert_eq!(correlation_key(Some("ipl-42"), "cricket", "x"), "event:ipl-42");
        assert_eq!(correlation_key(None, "nba", "market_only"), "sport:nba:market_only");
        assert_eq!(correlation_key(Some(""), "nba", "x"), "sport:nba:x");
    }

    #[test]
    fn normalized_rejects_bad_prices_and_clamps_confidence() {
        let market = MarketSnapshot {
            market_id: "m1".into(),
            current_price: 0.4,
            ..Default::default()
        };
        let sig = Signal::new("s", &market, Direction::BuyYes, 0.4, 0.5, 0.3, 1.4, 10.0, "r");
        let sig = sig.normalized().unwrap();
        assert_eq!(sig.confidence, 1.0);

        let bad = Signal::new("s", &market, Direction::BuyYes, 1.5, 0.5, 0.3, 0.7, 10.0, "r");
        assert!(bad.normalized().is_err());
    }
}
