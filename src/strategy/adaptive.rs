//! Adaptive Threshold Store
//!
//! Learns a per-strategy threshold multiplier from closed-trade outcomes.
//! Winning strategies get looser thresholds (< 1.0), losing ones tighter
//! (> 1.0). A global emergency multiplier loosens everything after a long
//! stretch without trades.
//!
//! Writes go through one mutex (single writer). Readers take a cheap clone of
//! the last published `Arc<ThresholdSnapshot>`, so a read never waits on a
//! recompute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::types::ClosedTrade;

const MAX_ADJUSTMENT_LOG: usize = 100;

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Total trades before a strategy's multiplier may move
    pub min_trades: usize,
    /// Trades since the last adjustment before the next recompute
    pub adjust_every: usize,
    /// Trailing window classified on each recompute
    pub lookback: usize,
    /// Average pnl (USD) below which a strategy is tightened regardless of win rate
    pub bad_avg_pnl: f64,
    pub emergency_hours: f64,
    pub emergency_step: f64,
    pub emergency_floor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_trades: 10,
            adjust_every: 5,
            lookback: 50,
            bad_avg_pnl: -1.0,
            emergency_hours: 6.0,
            emergency_step: 0.05, // 5% looser per hour over
            emergency_floor: 0.5,
        }
    }
}

/// One closed trade as seen by the learner
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub pnl: f64,
    pub at: DateTime<Utc>,
}

/// Rolling performance of a single strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub strategy_id: String,
    pub window: VecDeque<TradeOutcome>,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub threshold_multiplier: f64,
    pub last_adjusted_at: Option<DateTime<Utc>>,
    pub trades_since_adjustment: usize,
}

impl StrategyPerformance {
    fn new(strategy_id: &str) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            window: VecDeque::new(),
            total_trades: 0,
            wins: 0,
            losses: 0,
            threshold_multiplier: 1.0,
            last_adjusted_at: None,
            trades_since_adjustment: 0,
        }
    }

    /// (win_rate, avg_pnl) over the last `lookback` trades
    pub fn recent_performance(&self, lookback: usize) -> (f64, f64) {
        let recent: Vec<&TradeOutcome> = self.window.iter().rev().take(lookback).collect();
        if recent.is_empty() {
            return (0.0, 0.0);
        }
        let n = recent.len() as f64;
        let wins = recent.iter().filter(|t| t.pnl > 0.0).count() as f64;
        let total: f64 = recent.iter().map(|t| t.pnl).sum();
        (wins / n, total / n)
    }
}

/// Logged multiplier change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdAdjustment {
    pub strategy_id: String,
    pub old_multiplier: f64,
    pub new_multiplier: f64,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Immutable view published after every write
#[derive(Debug, Clone)]
pub struct ThresholdSnapshot {
    multipliers: HashMap<String, f64>,
    emergency_multiplier: f64,
    emergency_floor: f64,
}

impl ThresholdSnapshot {
    fn multiplier_for(&self, strategy_id: &str) -> f64 {
        let own = self.multipliers.get(strategy_id).copied().unwrap_or(1.0);
        if self.emergency_multiplier < 1.0 {
            (own * self.emergency_multiplier).max(self.emergency_floor)
        } else {
            own
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatsRow {
    pub strategy_id: String,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveStats {
    pub strategies: Vec<StrategyStatsRow>,
    pub emergency_mode: bool,
    pub emergency_multiplier: f64,
    pub hours_since_last_trade: f64,
    pub adjustments: usize,
}

struct WriterState {
    performance: HashMap<String, StrategyPerformance>,
    last_trade_at: DateTime<Utc>,
    emergency_multiplier: f64,
    log: VecDeque<ThresholdAdjustment>,
}

pub struct AdaptiveThresholds {
    config: AdaptiveConfig,
    state: Mutex<WriterState>,
    snapshot: RwLock<Arc<ThresholdSnapshot>>,
}

impl AdaptiveThresholds {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self::new_at(config, Utc::now())
    }

    /// Start with the inactivity clock at `now`.
    pub fn new_at(config: AdaptiveConfig, now: DateTime<Utc>) -> Self {
        let snapshot = ThresholdSnapshot {
            multipliers: HashMap::new(),
            emergency_multiplier: 1.0,
            emergency_floor: config.emergency_floor,
        };
        Self {
            config,
            state: Mutex::new(WriterState {
                performance: HashMap::new(),
                last_trade_at: now,
                emergency_multiplier: 1.0,
                log: VecDeque::new(),
            }),
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Effective multiplier: the strategy's own value times the emergency factor.
    pub fn get_multiplier(&self, strategy_id: &str) -> f64 {
        self.snapshot
            .read()
            .map(|s| s.multiplier_for(strategy_id))
            .unwrap_or(1.0)
    }

    /// Strategy's own multiplier without emergency loosening.
    pub fn strategy_multiplier(&self, strategy_id: &str) -> f64 {
        self.snapshot
            .read()
            .map(|s| s.multipliers.get(strategy_id).copied().unwrap_or(1.0))
            .unwrap_or(1.0)
    }

    pub fn emergency_mode(&self) -> bool {
        self.snapshot
            .read()
            .map(|s| s.emergency_multiplier < 1.0)
            .unwrap_or(false)
    }

    /// Record one closed trade and recompute the strategy when due.
    pub fn record_trade(&self, strategy_id: &str, pnl: f64, at: DateTime<Utc>) {
        let Ok(mut state) = self.state.lock() else {
            warn!(strategy = strategy_id, "[ADAPTIVE] State lock poisoned, trade not recorded");
            return;
        };

        if at > state.last_trade_at {
            state.last_trade_at = at;
        }
        if state.emergency_multiplier < 1.0 {
            info!("[ADAPTIVE] Trade recorded, emergency mode cleared");
        }
        state.emergency_multiplier = 1.0;

        let cap = self.config.lookback * 2;
        let perf = state
            .performance
            .entry(strategy_id.to_string())
            .or_insert_with(|| StrategyPerformance::new(strategy_id));
        perf.window.push_back(TradeOutcome { pnl, at });
        while perf.window.len() > cap {
            perf.window.pop_front();
        }
        perf.total_trades += 1;
        perf.trades_since_adjustment += 1;
        if pnl > 0.0 {
            perf.wins += 1;
        } else {
            perf.losses += 1;
        }

        let adjustment = self.maybe_adjust(perf, at);
        if let Some(adj) = adjustment {
            state.log.push_back(adj);
            while state.log.len() > MAX_ADJUSTMENT_LOG {
                state.log.pop_front();
            }
        }
        self.publish(&state);
    }

    /// Replay persisted history at startup. Clears nothing.
    pub fn warm_start(&self, history: &[ClosedTrade]) {
        let mut ordered: Vec<&ClosedTrade> = history.iter().collect();
        ordered.sort_by_key(|t| t.closed_at);
        for trade in ordered {
            self.record_trade(&trade.strategy_id, trade.pnl, trade.closed_at);
        }
        if !history.is_empty() {
            info!(trades = history.len(), "[ADAPTIVE] Warm-started from trade history");
        }
    }

    /// Recompute the emergency multiplier. Called once per decision cycle.
    pub fn check_emergency(&self, now: DateTime<Utc>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let hours_since = (now - state.last_trade_at).num_seconds() as f64 / 3600.0;
        let was_emergency = state.emergency_multiplier < 1.0;

        if hours_since > self.config.emergency_hours {
            let hours_over = hours_since - self.config.emergency_hours;
            let multiplier = (1.0 - self.config.emergency_step * hours_over)
                .max(self.config.emergency_floor)
                .min(1.0 - f64::EPSILON);
            state.emergency_multiplier = multiplier;
            if !was_emergency {
                warn!(
                    hours_since = %format!("{:.1}", hours_since),
                    multiplier = %format!("{:.3}", multiplier),
                    "[ADAPTIVE] No trades for too long, emergency loosening active"
                );
            }
        } else {
            state.emergency_multiplier = 1.0;
        }
        self.publish(&state);
        state.emergency_multiplier < 1.0
    }

    fn maybe_adjust(&self, perf: &mut StrategyPerformance, at: DateTime<Utc>) -> Option<ThresholdAdjustment> {
        if perf.total_trades < self.config.min_trades
            || perf.trades_since_adjustment < self.config.adjust_every
        {
            return None;
        }

        let (win_rate, avg_pnl) = perf.recent_performance(self.config.lookback);
        let old = perf.threshold_multiplier;

        let (new, reason) = if win_rate >= 0.70 && avg_pnl > 0.0 {
            (loosen(old, 0.9, 0.6), "strong performance, loosening")
        } else if win_rate >= 0.60 && avg_pnl > 0.0 {
            (loosen(old, 0.95, 0.8), "good performance, slight loosening")
        } else if win_rate < 0.45 || avg_pnl < self.config.bad_avg_pnl {
            (tighten(old, 1.1, 1.5), "poor performance, tightening")
        } else if win_rate < 0.55 {
            (tighten(old, 1.05, 1.2), "below target, slight tightening")
        } else {
            return None;
        };

        perf.threshold_multiplier = new;
        perf.last_adjusted_at = Some(at);
        perf.trades_since_adjustment = 0;

        if (new - old).abs() > f64::EPSILON {
            info!(
                strategy = %perf.strategy_id,
                old = %format!("{:.3}", old),
                new = %format!("{:.3}", new),
                win_rate = %format!("{:.1}%", win_rate * 100.0),
                avg_pnl = %format!("${:+.2}", avg_pnl),
                "[ADAPTIVE] Threshold adjusted: {}",
                reason
            );
        }

        Some(ThresholdAdjustment {
            strategy_id: perf.strategy_id.clone(),
            old_multiplier: old,
            new_multiplier: new,
            win_rate,
            avg_pnl,
            reason: reason.to_string(),
            at,
        })
    }

    fn publish(&self, state: &WriterState) {
        let snapshot = ThresholdSnapshot {
            multipliers: state
                .performance
                .iter()
                .map(|(k, p)| (k.clone(), p.threshold_multiplier))
                .collect(),
            emergency_multiplier: state.emergency_multiplier,
            emergency_floor: self.config.emergency_floor,
        };
        if let Ok(mut slot) = self.snapshot.write() {
            *slot = Arc::new(snapshot);
        }
    }

    pub fn performance(&self, strategy_id: &str) -> Option<StrategyPerformance> {
        self.state.lock().ok()?.performance.get(strategy_id).cloned()
    }

    pub fn adjustment_log(&self) -> Vec<ThresholdAdjustment> {
        self.state
            .lock()
            .map(|s| s.log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> AdaptiveStats {
        let Ok(state) = self.state.lock() else {
            return AdaptiveStats {
                strategies: Vec::new(),
                emergency_mode: false,
                emergency_multiplier: 1.0,
                hours_since_last_trade: 0.0,
                adjustments: 0,
            };
        };
        let mut strategies: Vec<StrategyStatsRow> = state
            .performance
            .values()
            .map(|p| {
                let (win_rate, avg_pnl) = p.recent_performance(self.config.lookback);
                StrategyStatsRow {
                    strategy_id: p.strategy_id.clone(),
                    trades: p.total_trades,
                    wins: p.wins,
                    losses: p.losses,
                    win_rate,
                    avg_pnl,
                    multiplier: p.threshold_multiplier,
                }
            })
            .collect();
        strategies.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));

        AdaptiveStats {
            strategies,
            emergency_mode: state.emergency_multiplier < 1.0,
            emergency_multiplier: state.emergency_multiplier,
            hours_since_last_trade: (now - state.last_trade_at).num_seconds() as f64 / 3600.0,
            adjustments: state.log.len(),
        }
    }
}

/// Multiply toward `floor` without ever crossing it upward.
fn loosen(old: f64, factor: f64, floor: f64) -> f64 {
    if old <= floor {
        old
    } else {
        (old * factor).max(floor)
    }
}

fn tighten(old: f64, factor: f64, cap: f64) -> f64 {
    if old >= cap {
        old
    } else {
        (old * factor).min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> (AdaptiveThresholds, DateTime<Utc>) {
        let t0 = Utc::now();
        (AdaptiveThresholds::new_at(AdaptiveConfig::default(), t0), t0)
    }

    /// 8 wins of +2 and 2 losses of -1 per block of 10
    fn record_block(store: &AdaptiveThresholds, strategy: &str, start: DateTime<Utc>, offset: i64) {
        for i in 0..10 {
            let pnl = if i % 5 == 4 { -1.0 } else { 2.0 };
            store.record_trade(strategy, pnl, start + Duration::minutes(offset + i));
        }
    }

    #[test]
    fn no_adjustment_before_min_trades() {
        let (store, t0) = store();
        for i in 0..9 {
            store.record_trade("market_only", 5.0, t0 + Duration::minutes(i));
        }
        assert_eq!(store.get_multiplier("market_only"), 1.0);
    }

    #[test]
    fn winning_strategy_loosens_and_clamps_at_floor() {
        let (store, t0) = store();
        record_block(&store, "market_only", t0, 0);
        let after_ten = store.get_multiplier("market_only");
        assert!((after_ten - 0.9).abs() < 1e-9, "Expected 0.9, got {}", after_ten);

        for block in 1..12 {
            record_block(&store, "market_only", t0, block * 10);
        }
        let floor = store.get_multiplier("market_only");
        assert!((floor - 0.6).abs() < 1e-9, "Expected floor 0.6, got {}", floor);
    }

    #[test]
    fn debounce_requires_five_new_trades() {
        let (store, t0) = store();
        record_block(&store, "s", t0, 0);
        let first = store.get_multiplier("s");
        for i in 0..4 {
            store.record_trade("s", 2.0, t0 + Duration::minutes(20 + i));
        }
        assert_eq!(store.get_multiplier("s"), first);
        store.record_trade("s", 2.0, t0 + Duration::minutes(30));
        assert!(store.get_multiplier("s") < first);
    }

    #[test]
    fn losing_strategy_tightens_to_cap() {
        let (store, t0) = store();
        for i in 0..100 {
            store.record_trade("favorite_trap", -3.0, t0 + Duration::minutes(i));
        }
        let m = store.get_multiplier("favorite_trap");
        assert!((m - 1.5).abs() < 1e-9, "Expected cap 1.5, got {}", m);
        assert!(!store.adjustment_log().is_empty());
    }

    #[test]
    fn middling_band_leaves_multiplier_and_debounce_alone() {
        let (store, t0) = store();
        // W W L W L: win rate stays in 55-67% with a non-positive average
        for i in 0..25 {
            let pnl = if matches!(i % 5, 2 | 4) { -2.0 } else { 1.0 };
            store.record_trade("s", pnl, t0 + Duration::minutes(i));
        }
        assert_eq!(store.get_multiplier("s"), 1.0);
        let perf = store.performance("s").unwrap();
        assert!(perf.last_adjusted_at.is_none());
        assert_eq!(perf.trades_since_adjustment, 25);
    }

    #[test]
    fn emergency_mode_after_long_idle_and_cleared_by_trade() {
        let (store, t0) = store();
        let own = store.get_multiplier("market_only");

        assert!(!store.check_emergency(t0 + Duration::hours(5)));
        assert!(store.check_emergency(t0 + Duration::hours(7)));
        assert!(store.emergency_mode());
        let loosened = store.get_multiplier("market_only");
        assert!(loosened < own, "Expected {} < {}", loosened, own);
        assert!((loosened - 0.95).abs() < 1e-6);

        store.record_trade("market_only", 1.0, t0 + Duration::hours(7));
        assert!(!store.emergency_mode());
        assert_eq!(store.get_multiplier("market_only"), own);
    }

    #[test]
    fn emergency_multiplier_floors_at_half() {
        let (store, t0) = store();
        store.check_emergency(t0 + Duration::hours(48));
        assert!((store.get_multiplier("x") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn multiplier_stable_between_reads() {
        let (store, t0) = store();
        record_block(&store, "s", t0, 0);
        let a = store.get_multiplier("s");
        let b = store.get_multiplier("s");
        assert_eq!(a, b);
        let stats = store.stats(t0 + Duration::hours(1));
        assert_eq!(stats.strategies.len(), 1);
        assert_eq!(stats.strategies[0].trades, 10);
    }
}
