//! Paper Trading - Position Ledger
//!
//! Simulated execution against market quotes. Owns every open position.
//!
//! Key features:
//! - **Size-scaled slippage**: fills are always worse than the quote
//! - **Per-tick mark-to-market**: take profit, stop loss, trailing stop, max hold
//! - **Pyramiding**: child entries into winning parents, closed with the parent
//! - **Feedback**: every settled position updates the risk gate and adaptive store
//! - **State persistence**: Saves/loads state to JSON file for recovery on restart

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::risk::{Admission, RiskGate, RiskWarning};
use crate::strategy::adaptive::AdaptiveThresholds;
use crate::types::{ClosedTrade, Direction, ExitReason, Signal, TradeResult};

const BALANCE_EPSILON: f64 = 1e-6;
/// Tolerance for percent thresholds (0.50 -> 0.60 is 19.999..% in f64)
const PCT_EPSILON: f64 = 1e-9;
const MAX_SAVED_TRADES: usize = 500;
/// Fills are kept strictly inside the binary price range
const MIN_FILL_PRICE: f64 = 0.001;
const MAX_FILL_PRICE: f64 = 0.999;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidConfig {
    pub enabled: bool,
    /// Profit step (percent) between successive child entries
    pub trigger_pct: f64,
    /// Child size as a percent of the parent's size
    pub size_pct: f64,
    pub max_levels: u32,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_pct: 10.0,
            size_pct: 50.0,
            max_levels: 3,
        }
    }
}

/// Ledger configuration. `Default` is the standard profile.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub starting_balance: f64,
    /// Smallest fill the ledger accepts (USD)
    pub min_trade_usd: f64,
    /// Absolute per-position cap (USD)
    pub max_position_usd: f64,
    /// Σ open size allowed per correlation key (USD)
    pub max_correlated_exposure_usd: f64,
    pub slippage_base: f64,
    /// Extra slippage per $1000 of size
    pub slippage_size_factor: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// Gain that arms the trailing stop (0 = armed once in profit)
    pub trailing_activation_pct: f64,
    /// Drawdown from the high-water mark that closes an armed position
    pub trailing_stop_pct: f64,
    pub max_hold: Duration,
    pub pyramid: PyramidConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_balance: 1000.0,
            min_trade_usd: 1.0,
            max_position_usd: 50.0,
            max_correlated_exposure_usd: 100.0,
            slippage_base: 0.001,
            slippage_size_factor: 0.004,
            take_profit_pct: 20.0,
            stop_loss_pct: 10.0,
            trailing_activation_pct: 0.0,
            trailing_stop_pct: 8.0,
            max_hold: Duration::minutes(60),
            pyramid: PyramidConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Wider exits, longer holds and pyramiding into winners
    pub fn aggressive() -> Self {
        Self {
            min_trade_usd: 10.0,
            take_profit_pct: 50.0,
            stop_loss_pct: 15.0,
            trailing_activation_pct: 20.0,
            trailing_stop_pct: 15.0,
            max_hold: Duration::minutes(240),
            pyramid: PyramidConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Fractional slippage for a fill of `size` USD.
    pub fn slippage_for(&self, size: f64) -> f64 {
        self.slippage_base + (size / 1000.0) * self.slippage_size_factor
    }

    /// Fill price for `quote`, moved against the trader.
    pub fn fill_price(&self, direction: Direction, quote: f64, size: f64) -> f64 {
        let s = self.slippage_for(size);
        let fill = match direction {
            Direction::BuyYes => quote * (1.0 + s),
            Direction::BuyNo => quote * (1.0 - s),
        };
        fill.clamp(MIN_FILL_PRICE, MAX_FILL_PRICE)
    }
}

// ─────────────────────────────────────────────────────────────────
// Positions
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Opening,
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub market_id: String,
    pub strategy_id: String,
    pub correlation_key: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub current_price: f64,
    /// USD committed at entry
    pub size: f64,
    pub confidence: f64,
    /// Most favorable price seen since entry
    pub high_water_mark: f64,
    pub trailing_armed: bool,
    /// 0 for an original entry, 1.. for pyramid children
    pub pyramid_level: u32,
    pub parent_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub unrealized_pnl: f64,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Children opened from this position so far
    pub pyramid_triggers: u32,
}

impl Position {
    pub fn from_signal(signal: &Signal, fill_price: f64, size: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: signal.market_id.clone(),
            strategy_id: signal.strategy_id.clone(),
            correlation_key: signal.correlation_key.clone(),
            direction: signal.direction,
            entry_price: fill_price,
            current_price: fill_price,
            size,
            confidence: signal.confidence,
            high_water_mark: fill_price,
            trailing_armed: false,
            pyramid_level: 0,
            parent_id: None,
            opened_at: now,
            status: PositionStatus::Opening,
            unrealized_pnl: 0.0,
            last_tick_at: None,
            pyramid_triggers: 0,
        }
    }

    fn pyramid_child(parent: &Position, fill_price: f64, size: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: parent.market_id.clone(),
            strategy_id: parent.strategy_id.clone(),
            correlation_key: parent.correlation_key.clone(),
            direction: parent.direction,
            entry_price: fill_price,
            current_price: fill_price,
            size,
            confidence: parent.confidence,
            high_water_mark: fill_price,
            trailing_armed: false,
            pyramid_level: parent.pyramid_triggers + 1,
            parent_id: Some(parent.id.clone()),
            opened_at: now,
            status: PositionStatus::Open,
            unrealized_pnl: 0.0,
            last_tick_at: Some(now),
            pyramid_triggers: 0,
        }
    }

    pub fn pnl_pct(&self) -> f64 {
        self.direction.pnl_pct(self.entry_price, self.current_price)
    }

    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }

    fn apply_price(&mut self, price: f64, at: DateTime<Utc>) {
        self.current_price = price;
        self.last_tick_at = Some(at);
        if self.direction.is_more_favorable(price, self.high_water_mark) {
            self.high_water_mark = price;
        }
        self.unrealized_pnl = self.size * self.pnl_pct() / 100.0;
    }
}

/// Result of one price tick: settled trades and pyramid children opened.
#[derive(Debug, Clone, Default)]
pub struct MarkOutcome {
    pub closed: Vec<ClosedTrade>,
    pub opened: Vec<Position>,
}

// ─────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyBreakdown {
    pub trades: u32,
    pub wins: u32,
    pub pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub peak_balance: f64,
    /// Max drawdown of settled capital, percent
    pub max_drawdown: f64,
    pub exits_by_reason: HashMap<String, u32>,
    pub by_strategy: HashMap<String, StrategyBreakdown>,
}

impl PerformanceStats {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.total_trades as f64 * 100.0
        }
    }

    pub fn avg_win(&self) -> f64 {
        if self.wins == 0 {
            0.0
        } else {
            self.gross_profit / self.wins as f64
        }
    }

    pub fn avg_loss(&self) -> f64 {
        if self.losses == 0 {
            0.0
        } else {
            -self.gross_loss / self.losses as f64
        }
    }

    pub fn profit_factor(&self) -> f64 {
        if self.gross_loss > 0.0 {
            self.gross_profit / self.gross_loss
        } else {
            0.0
        }
    }

    fn record(&mut self, trade: &ClosedTrade, capital: f64) {
        self.total_trades += 1;
        self.total_pnl += trade.pnl;
        match trade.result() {
            TradeResult::Win => {
                self.wins += 1;
                self.gross_profit += trade.pnl;
                self.largest_win = self.largest_win.max(trade.pnl);
            }
            TradeResult::Loss => {
                self.losses += 1;
                self.gross_loss += trade.pnl.abs();
                self.largest_loss = self.largest_loss.min(trade.pnl);
            }
        }
        *self
            .exits_by_reason
            .entry(trade.exit_reason.to_string())
            .or_insert(0) += 1;
        let entry = self.by_strategy.entry(trade.strategy_id.clone()).or_default();
        entry.trades += 1;
        entry.pnl += trade.pnl;
        if trade.pnl > 0.0 {
            entry.wins += 1;
        }

        if capital > self.peak_balance {
            self.peak_balance = capital;
        } else if self.peak_balance > 0.0 {
            let dd = (self.peak_balance - capital) / self.peak_balance * 100.0;
            self.max_drawdown = self.max_drawdown.max(dd);
        }
    }
}

/// Serializable ledger state for restart recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    pub balance: f64,
    pub positions: Vec<Position>,
    pub trade_history: Vec<ClosedTrade>,
    pub stats: PerformanceStats,
    pub saved_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────
// Position Ledger
// ─────────────────────────────────────────────────────────────────

pub struct PositionLedger {
    config: LedgerConfig,
    balance: RwLock<f64>,
    positions: RwLock<HashMap<String, Position>>,
    trade_history: RwLock<Vec<ClosedTrade>>,
    stats: RwLock<PerformanceStats>,
    /// Warnings raised by the risk gate during settlement, drained by the engine
    risk_warnings: RwLock<Vec<RiskWarning>>,
    risk: Option<Arc<RiskGate>>,
    adaptive: Option<Arc<AdaptiveThresholds>>,
    /// Path to save state file
    state_file: Option<PathBuf>,
}

fn poisoned(what: &str) -> PipelineError {
    PipelineError::InvariantViolation(format!("{} lock poisoned", what))
}

impl PositionLedger {
    pub fn new(config: LedgerConfig) -> Self {
        let starting_balance = config.starting_balance;
        Self {
            config,
            balance: RwLock::new(starting_balance),
            positions: RwLock::new(HashMap::new()),
            trade_history: RwLock::new(Vec::new()),
            stats: RwLock::new(PerformanceStats {
                peak_balance: starting_balance,
                ..Default::default()
            }),
            risk_warnings: RwLock::new(Vec::new()),
            risk: None,
            adaptive: None,
            state_file: None,
        }
    }

    pub fn with_risk_gate(mut self, risk: Arc<RiskGate>) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_adaptive(mut self, adaptive: Arc<AdaptiveThresholds>) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Set the state file path for persistence
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // ── Opening ─────────────────────────────────────────────────

    /// Check exposure and balance for a new entry, then debit the balance.
    /// Returns the size actually committed.
    fn reserve(
        &self,
        positions: &HashMap<String, Position>,
        correlation_key: &str,
        requested: f64,
    ) -> Result<f64, PipelineError> {
        if !requested.is_finite() || requested <= 0.0 {
            return Err(PipelineError::InsufficientBalance {
                requested,
                available: self.balance(),
            });
        }
        let requested = requested.min(self.config.max_position_usd);

        let existing: f64 = positions
            .values()
            .filter(|p| p.correlation_key == correlation_key)
            .map(|p| p.size)
            .sum();
        if existing + requested > self.config.max_correlated_exposure_usd + BALANCE_EPSILON {
            return Err(PipelineError::ExposureLimit {
                key: correlation_key.to_string(),
                existing,
                requested,
                max: self.config.max_correlated_exposure_usd,
            });
        }

        let mut balance = self.balance.write().map_err(|_| poisoned("balance"))?;
        let available = *balance;
        let mut size = requested;
        if size > available {
            size = available * 0.9;
            warn!(
                requested = %format!("${:.2}", requested),
                available = %format!("${:.2}", available),
                reduced = %format!("${:.2}", size),
                "[PAPER] Insufficient available balance, reducing size"
            );
        }
        if size < self.config.min_trade_usd {
            return Err(PipelineError::InsufficientBalance {
                requested,
                available,
            });
        }
        *balance -= size;
        Ok(size)
    }

    /// Open a position for an admitted signal. `size` is the risk-gate size.
    pub fn open(
        &self,
        signal: &Signal,
        size: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, PipelineError> {
        let position = {
            let mut positions = self.positions.write().map_err(|_| poisoned("positions"))?;
            let size = self.reserve(&positions, &signal.correlation_key, size)?;
            let fill_price = self
                .config
                .fill_price(signal.direction, signal.entry_price, size);
            let mut position = Position::from_signal(signal, fill_price, size, now);
            position.status = PositionStatus::Open;
            positions.insert(position.id.clone(), position.clone());
            position
        };

        if let Some(risk) = &self.risk {
            risk.on_open_at(&position, now);
        }

        info!(
            position_id = %position.id,
            market = %position.market_id,
            strategy = %position.strategy_id,
            direction = %position.direction,
            quote = %format!("{:.4}", signal.entry_price),
            fill = %format!("{:.4}", position.entry_price),
            size = %format!("${:.2}", position.size),
            confidence = %format!("{:.2}", position.confidence),
            balance = %format!("${:.2}", self.balance()),
            "[PAPER] POSITION OPENED"
        );

        self.verify_invariants()?;
        self.persist_state();
        Ok(position)
    }

    /// Open the next pyramid level under `parent_id`. Skips quietly when the
    /// risk gate, exposure or balance does not allow it.
    fn open_pyramid(
        &self,
        parent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Position>, PipelineError> {
        let child = {
            let mut positions = self.positions.write().map_err(|_| poisoned("positions"))?;
            let Some(parent) = positions.get(parent_id).cloned() else {
                return Ok(None);
            };
            let requested = parent.size * self.config.pyramid.size_pct / 100.0;
            if let Some(risk) = &self.risk {
                if let Admission::Rejected(reason) =
                    risk.can_add_at(&parent, requested, positions.len(), at)
                {
                    debug!(parent = %parent_id, reason = %reason, "[PAPER] Pyramid level refused by risk gate");
                    return Ok(None);
                }
            }
            let size = match self.reserve(&positions, &parent.correlation_key, requested) {
                Ok(size) => size,
                Err(e) => {
                    debug!(parent = %parent_id, error = %e, "[PAPER] Pyramid level skipped");
                    return Ok(None);
                }
            };
            let fill_price = self
                .config
                .fill_price(parent.direction, parent.current_price, size);
            let child = Position::pyramid_child(&parent, fill_price, size, at);
            if let Some(p) = positions.get_mut(parent_id) {
                p.pyramid_triggers += 1;
            }
            positions.insert(child.id.clone(), child.clone());
            child
        };

        if let Some(risk) = &self.risk {
            risk.on_open_at(&child, at);
        }

        info!(
            position_id = %child.id,
            parent = %parent_id,
            level = child.pyramid_level,
            fill = %format!("{:.4}", child.entry_price),
            size = %format!("${:.2}", child.size),
            "[PAPER] PYRAMID ADDED"
        );

        self.verify_invariants()?;
        Ok(Some(child))
    }

    // ── Mark-to-market ──────────────────────────────────────────

    fn exit_trigger(&self, pos: &Position, at: DateTime<Utc>) -> Option<(ExitReason, String)> {
        let pnl_pct = pos.pnl_pct();
        if pnl_pct >= self.config.take_profit_pct - PCT_EPSILON {
            return Some((
                ExitReason::TakeProfit,
                format!("Take profit at {:+.1}%", pnl_pct),
            ));
        }
        if pnl_pct <= -self.config.stop_loss_pct + PCT_EPSILON {
            return Some((ExitReason::StopLoss, format!("Stop loss at {:+.1}%", pnl_pct)));
        }
        if pos.trailing_armed {
            let drawdown = pos.direction.drawdown_pct(pos.high_water_mark, pos.current_price);
            if drawdown > self.config.trailing_stop_pct {
                return Some((
                    ExitReason::TrailingStop,
                    format!(
                        "Trailing stop: {:.1}% off high {:.4} ({:+.1}%)",
                        drawdown, pos.high_water_mark, pnl_pct
                    ),
                ));
            }
        }
        if at - pos.opened_at > self.config.max_hold {
            return Some((
                ExitReason::Timeout,
                format!(
                    "Max hold {} min exceeded ({:+.1}%)",
                    self.config.max_hold.num_minutes(),
                    pnl_pct
                ),
            ));
        }
        None
    }

    fn pyramid_due(&self, pos: &Position) -> bool {
        let pyramid = &self.config.pyramid;
        pyramid.enabled
            && !pos.is_child()
            && pos.pyramid_triggers < pyramid.max_levels
            && pos.pnl_pct() >= pyramid.trigger_pct * (pos.pyramid_triggers + 1) as f64 - PCT_EPSILON
    }

    /// Apply a price tick to every open position on `market_id`.
    ///
    /// Ticks older than a position's last applied tick are dropped.
    pub fn mark(
        &self,
        market_id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, PipelineError> {
        let mut outcome = MarkOutcome::default();
        if !price.is_finite() || price <= 0.0 || price > 1.0 {
            debug!(market = %market_id, price, "[PAPER] Ignoring unusable tick");
            return Ok(outcome);
        }

        let mut exits: Vec<(u32, String, ExitReason, String)> = Vec::new();
        let mut pyramids: Vec<String> = Vec::new();
        {
            let mut positions = self.positions.write().map_err(|_| poisoned("positions"))?;
            for pos in positions
                .values_mut()
                .filter(|p| p.market_id == market_id && p.status == PositionStatus::Open)
            {
                if let Some(last) = pos.last_tick_at {
                    if at < last {
                        debug!(
                            position_id = %pos.id,
                            tick = %at,
                            last = %last,
                            "[PAPER] Dropping stale tick"
                        );
                        continue;
                    }
                }
                pos.apply_price(price, at);

                let pnl_pct = pos.pnl_pct();
                if !pos.trailing_armed
                    && pnl_pct > 0.0
                    && pnl_pct >= self.config.trailing_activation_pct - PCT_EPSILON
                {
                    pos.trailing_armed = true;
                    debug!(position_id = %pos.id, pnl_pct, "[PAPER] Trailing stop armed");
                }

                if let Some((reason, detail)) = self.exit_trigger(pos, at) {
                    exits.push((pos.pyramid_level, pos.id.clone(), reason, detail));
                } else if self.pyramid_due(pos) {
                    pyramids.push(pos.id.clone());
                }
            }
        }

        for parent_id in pyramids {
            if let Some(child) = self.open_pyramid(&parent_id, at)? {
                outcome.opened.push(child);
            }
        }

        // Parents first so their children settle as PARENT_CLOSED
        exits.sort_by_key(|(level, ..)| *level);
        for (_, id, reason, detail) in exits {
            outcome.closed.extend(self.close(&id, reason, &detail, at)?);
        }
        Ok(outcome)
    }

    /// Close positions past max hold that have not seen a tick to do it.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<ClosedTrade>, PipelineError> {
        let mut expired: Vec<(u32, String, f64)> = self
            .positions
            .read()
            .map_err(|_| poisoned("positions"))?
            .values()
            .filter(|p| now - p.opened_at > self.config.max_hold)
            .map(|p| (p.pyramid_level, p.id.clone(), p.pnl_pct()))
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));

        let mut closed = Vec::new();
        for (_, id, pnl_pct) in expired {
            let detail = format!(
                "Max hold {} min exceeded ({:+.1}%)",
                self.config.max_hold.num_minutes(),
                pnl_pct
            );
            closed.extend(self.close(&id, ExitReason::Timeout, &detail, now)?);
        }
        Ok(closed)
    }

    // ── Settlement ──────────────────────────────────────────────

    /// Close a position and cascade-close its open pyramid children.
    /// Unknown ids (already closed) yield no records.
    pub fn close(
        &self,
        id: &str,
        reason: ExitReason,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<ClosedTrade>, PipelineError> {
        let (position, mut children) = {
            let mut positions = self.positions.write().map_err(|_| poisoned("positions"))?;
            let Some(position) = positions.remove(id) else {
                return Ok(Vec::new());
            };
            let child_ids: Vec<String> = positions
                .values()
                .filter(|p| p.parent_id.as_deref() == Some(id))
                .map(|p| p.id.clone())
                .collect();
            let children: Vec<Position> = child_ids
                .iter()
                .filter_map(|child_id| positions.remove(child_id))
                .collect();
            (position, children)
        };
        children.sort_by_key(|c| c.pyramid_level);

        if let Some(parent_id) = &position.parent_id {
            debug!(
                position_id = %position.id,
                parent = %parent_id,
                "[PAPER] Pyramid child closed ahead of parent"
            );
        }

        let mut closed = Vec::with_capacity(children.len() + 1);
        closed.push(self.settle(position, reason, detail.to_string(), at));
        let cascade_detail = format!("Parent closed: {}", reason);
        for child in children {
            closed.push(self.settle(child, ExitReason::ParentClosed, cascade_detail.clone(), at));
        }

        self.verify_invariants()?;
        self.persist_state();
        Ok(closed)
    }

    fn settle(
        &self,
        mut position: Position,
        reason: ExitReason,
        detail: String,
        at: DateTime<Utc>,
    ) -> ClosedTrade {
        position.status = PositionStatus::Closed;
        let pnl_pct = position.pnl_pct();
        let pnl = position.size * pnl_pct / 100.0;

        let balance_after = match self.balance.write() {
            Ok(mut balance) => {
                *balance += position.size + pnl;
                *balance
            }
            Err(_) => {
                error!(position_id = %position.id, "[PAPER] Balance lock poisoned during settlement");
                f64::NAN
            }
        };

        let trade = ClosedTrade {
            id: position.id.clone(),
            parent_id: position.parent_id.clone(),
            pyramid_level: position.pyramid_level,
            strategy_id: position.strategy_id.clone(),
            market_id: position.market_id.clone(),
            correlation_key: position.correlation_key.clone(),
            direction: position.direction,
            confidence: position.confidence,
            size: position.size,
            entry_price: position.entry_price,
            exit_price: position.current_price,
            pnl,
            pnl_pct,
            opened_at: position.opened_at,
            closed_at: at,
            exit_reason: reason,
            exit_detail: detail,
            balance_after,
        };

        let capital = balance_after + self.locked_balance();
        if let Ok(mut stats) = self.stats.write() {
            stats.record(&trade, capital);
        }
        if let Ok(mut history) = self.trade_history.write() {
            history.push(trade.clone());
        }

        if let Some(risk) = &self.risk {
            let warnings = risk.on_close_at(&position, pnl, at);
            if !warnings.is_empty() {
                if let Ok(mut pending) = self.risk_warnings.write() {
                    pending.extend(warnings);
                }
            }
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.record_trade(&position.strategy_id, pnl, at);
        }

        let label = if pnl > 0.0 { "OK" } else { "X" };
        info!(
            position_id = %trade.id,
            market = %trade.market_id,
            strategy = %trade.strategy_id,
            reason = %reason,
            entry = %format!("{:.4}", trade.entry_price),
            exit = %format!("{:.4}", trade.exit_price),
            pnl = %format!("${:+.2}", pnl),
            pnl_pct = %format!("{:+.1}%", pnl_pct),
            hold = %format!("{}s", trade.hold_secs()),
            balance = %format!("${:.2}", balance_after),
            "[PAPER] {} POSITION CLOSED",
            label
        );
        trade
    }

    // ── Invariants ──────────────────────────────────────────────

    /// Balance finite and non-negative, sizes within caps, no orphan children.
    pub fn verify_invariants(&self) -> Result<(), PipelineError> {
        let balance = self.balance();
        if !balance.is_finite() || balance < -BALANCE_EPSILON {
            return Err(PipelineError::InvariantViolation(format!(
                "balance {} not finite or negative",
                balance
            )));
        }

        let positions = self.positions.read().map_err(|_| poisoned("positions"))?;
        let mut exposure: HashMap<&str, f64> = HashMap::new();
        for pos in positions.values() {
            if pos.size > self.config.max_position_usd + BALANCE_EPSILON {
                return Err(PipelineError::InvariantViolation(format!(
                    "position {} size ${:.2} above cap ${:.2}",
                    pos.id, pos.size, self.config.max_position_usd
                )));
            }
            if let Some(parent) = &pos.parent_id {
                if !positions.contains_key(parent) {
                    return Err(PipelineError::InvariantViolation(format!(
                        "pyramid child {} has no open parent {}",
                        pos.id, parent
                    )));
                }
            }
            *exposure.entry(pos.correlation_key.as_str()).or_insert(0.0) += pos.size;
        }
        for (key, total) in exposure {
            if total > self.config.max_correlated_exposure_usd + BALANCE_EPSILON {
                return Err(PipelineError::InvariantViolation(format!(
                    "exposure ${:.2} on {} above ${:.2}",
                    total, key, self.config.max_correlated_exposure_usd
                )));
            }
        }
        Ok(())
    }

    // ── Getters ─────────────────────────────────────────────────

    pub fn balance(&self) -> f64 {
        self.balance.read().map(|b| *b).unwrap_or(f64::NAN)
    }

    /// USD committed to open positions
    pub fn locked_balance(&self) -> f64 {
        self.positions
            .read()
            .map(|p| p.values().map(|pos| pos.size).sum())
            .unwrap_or(0.0)
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions
            .read()
            .map(|p| p.values().map(|pos| pos.unrealized_pnl).sum())
            .unwrap_or(0.0)
    }

    /// balance + Σ unrealized pnl of open positions
    pub fn equity(&self) -> f64 {
        self.balance() + self.unrealized_pnl()
    }

    /// balance + committed size + unrealized pnl
    pub fn net_asset_value(&self) -> f64 {
        self.balance() + self.locked_balance() + self.unrealized_pnl()
    }

    /// Open positions, oldest first
    pub fn open_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .positions
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        self.positions.read().ok()?.get(id).cloned()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn trade_history(&self) -> Vec<ClosedTrade> {
        self.trade_history
            .read()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Realized return versus the starting balance, percent
    pub fn return_pct(&self) -> f64 {
        if self.config.starting_balance <= 0.0 {
            return 0.0;
        }
        self.performance_stats().total_pnl / self.config.starting_balance * 100.0
    }

    /// Risk warnings raised since the last call
    pub fn drain_risk_warnings(&self) -> Vec<RiskWarning> {
        self.risk_warnings
            .write()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default()
    }

    pub fn summary_string(&self) -> String {
        let stats = self.performance_stats();
        format!(
            "📋 Paper: ${:.2} bal | ${:.2} equity | {}/{} ({:.0}% WR) | P&L: ${:+.2} ({:+.1}%) | PF: {:.2} | DD: {:.1}% | {} open",
            self.balance(),
            self.equity(),
            stats.wins,
            stats.total_trades,
            stats.win_rate(),
            stats.total_pnl,
            self.return_pct(),
            stats.profit_factor(),
            stats.max_drawdown,
            self.open_position_count()
        )
    }

    // ── State persistence ───────────────────────────────────────

    fn persist_state(&self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "Failed to save ledger state");
        }
    }

    /// Save current state to JSON file
    pub fn save_state(&self) -> Result<()> {
        let state_file = match &self.state_file {
            Some(p) => p.clone(),
            None => return Ok(()), // No state file configured, skip saving
        };

        let state = self.export_state();
        let json = serde_json::to_string_pretty(&state)?;
        if let Some(parent) = state_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        fs::write(&state_file, json)
            .with_context(|| format!("writing {}", state_file.display()))?;
        debug!(path = %state_file.display(), "💾 [PAPER] State saved");
        Ok(())
    }

    /// Load state from JSON file
    pub fn load_state(&self) -> Result<()> {
        let state_file = match &self.state_file {
            Some(p) => p.clone(),
            None => return Ok(()), // No state file configured
        };

        if !state_file.exists() {
            info!(path = %state_file.display(), "💾 [PAPER] No state file found, starting fresh");
            return Ok(());
        }

        let json = fs::read_to_string(&state_file)
            .with_context(|| format!("reading {}", state_file.display()))?;
        let state: LedgerState = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", state_file.display()))?;

        self.import_state(&state);
        info!(
            path = %state_file.display(),
            balance = %format!("${:.2}", state.balance),
            positions = state.positions.len(),
            trades = state.stats.total_trades,
            "💾 [PAPER] State loaded"
        );
        Ok(())
    }

    fn export_state(&self) -> LedgerState {
        let history = self.trade_history();
        let skip = history.len().saturating_sub(MAX_SAVED_TRADES);
        LedgerState {
            balance: self.balance(),
            positions: self.open_positions(),
            trade_history: history.into_iter().skip(skip).collect(),
            stats: self.performance_stats(),
            saved_at: Utc::now(),
        }
    }

    fn import_state(&self, state: &LedgerState) {
        if let Ok(mut balance) = self.balance.write() {
            *balance = state.balance;
        }
        if let Ok(mut positions) = self.positions.write() {
            positions.clear();
            for pos in &state.positions {
                let mut pos = pos.clone();
                pos.status = PositionStatus::Open;
                if let Some(risk) = &self.risk {
                    risk.restore_open(&pos);
                }
                positions.insert(pos.id.clone(), pos);
            }
        }
        if let Ok(mut history) = self.trade_history.write() {
            *history = state.trade_history.clone();
        }
        if let Ok(mut stats) = self.stats.write() {
            *stats = state.stats.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskConfig;
    use crate::strategy::adaptive::AdaptiveConfig;
    use crate::types::MarketSnapshot;

    fn flat_config() -> LedgerConfig {
        LedgerConfig {
            slippage_base: 0.0,
            slippage_size_factor: 0.0,
            ..Default::default()
        }
    }

    fn make_signal(event: &str, direction: Direction, entry: f64, size: f64) -> Signal {
        let market = MarketSnapshot {
            market_id: format!("mkt-{}", event),
            event_id: Some(event.to_string()),
            sport: "nba".into(),
            current_price: entry,
            ..Default::default()
        };
        Signal::new("market_only", &market, direction, entry, entry, entry, 0.8, size, "test")
    }

    #[test]
    fn take_profit_realizes_size_times_move() {
        let ledger = PositionLedger::new(flat_config());
        let t0 = Utc::now();
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.50, 40.0), 40.0, t0)
            .unwrap();
        assert_eq!(ledger.balance(), 960.0);

        let out = ledger.mark(&pos.market_id, 0.60, t0 + Duration::minutes(1)).unwrap();
        assert_eq!(out.closed.len(), 1);
        let trade = &out.closed[0];
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert!((trade.pnl - 40.0 * 0.20).abs() < 1e-9, "Expected 8.0, got {}", trade.pnl);
        assert!((ledger.balance() - 1008.0).abs() < 1e-9);
        assert_eq!(ledger.open_position_count(), 0);
    }

    #[test]
    fn buy_no_stop_loss_on_rising_price() {
        let ledger = PositionLedger::new(flat_config());
        let t0 = Utc::now();
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyNo, 0.40, 20.0), 20.0, t0)
            .unwrap();
        let out = ledger.mark(&pos.market_id, 0.45, t0 + Duration::minutes(1)).unwrap();
        assert_eq!(out.closed[0].exit_reason, ExitReason::StopLoss);
        assert!(out.closed[0].pnl < 0.0);
    }

    #[test]
    fn fills_are_worse_than_quote() {
        let ledger = PositionLedger::new(LedgerConfig::default());
        let t0 = Utc::now();
        let yes = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.50, 20.0), 20.0, t0)
            .unwrap();
        let no = ledger
            .open(&make_signal("e2", Direction::BuyNo, 0.50, 20.0), 20.0, t0)
            .unwrap();
        let s = 0.001 + 0.02 * 0.004;
        assert!((yes.entry_price - 0.50 * (1.0 + s)).abs() < 1e-12);
        assert!((no.entry_price - 0.50 * (1.0 - s)).abs() < 1e-12);
    }

    #[test]
    fn trailing_stop_after_pullback_from_high() {
        let ledger = PositionLedger::new(flat_config());
        let t0 = Utc::now();
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.50, 20.0), 20.0, t0)
            .unwrap();
        assert!(ledger.mark(&pos.market_id, 0.55, t0 + Duration::minutes(1)).unwrap().closed.is_empty());
        assert!(ledger.position(&pos.id).unwrap().trailing_armed);

        let out = ledger.mark(&pos.market_id, 0.505, t0 + Duration::minutes(2)).unwrap();
        assert_eq!(out.closed.len(), 1);
        assert_eq!(out.closed[0].exit_reason, ExitReason::TrailingStop);
        assert!(out.closed[0].pnl > 0.0);
    }

    #[test]
    fn stale_ticks_are_dropped() {
        let ledger = PositionLedger::new(flat_config());
        let t0 = Utc::now();
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.50, 20.0), 20.0, t0)
            .unwrap();
        ledger.mark(&pos.market_id, 0.52, t0 + Duration::minutes(2)).unwrap();
        let out = ledger.mark(&pos.market_id, 0.70, t0 + Duration::minutes(1)).unwrap();
        assert!(out.closed.is_empty());
        let held = ledger.position(&pos.id).unwrap();
        assert_eq!(held.current_price, 0.52);
        assert_eq!(held.high_water_mark, 0.52);
    }

    #[test]
    fn timeout_uses_tick_time_and_sweep() {
        let ledger = PositionLedger::new(flat_config());
        let t0 = Utc::now();
        let a = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.50, 20.0), 20.0, t0)
            .unwrap();
        let out = ledger.mark(&a.market_id, 0.50, t0 + Duration::minutes(61)).unwrap();
        assert_eq!(out.closed[0].exit_reason, ExitReason::Timeout);

        let b = ledger
            .open(&make_signal("e2", Direction::BuyYes, 0.50, 20.0), 20.0, t0)
            .unwrap();
        assert!(ledger.check_timeouts(t0 + Duration::minutes(30)).unwrap().is_empty());
        let swept = ledger.check_timeouts(t0 + Duration::minutes(61)).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, b.id);
    }

    #[test]
    fn pyramids_open_on_steps_and_close_with_parent() {
        let config = LedgerConfig {
            slippage_base: 0.0,
            slippage_size_factor: 0.0,
            ..LedgerConfig::aggressive()
        };
        let ledger = PositionLedger::new(config);
        let t0 = Utc::now();
        let parent = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.40, 20.0), 20.0, t0)
            .unwrap();

        let first = ledger.mark(&parent.market_id, 0.45, t0 + Duration::minutes(1)).unwrap();
        assert_eq!(first.opened.len(), 1);
        assert_eq!(first.opened[0].pyramid_level, 1);
        assert_eq!(first.opened[0].parent_id.as_deref(), Some(parent.id.as_str()));
        assert!((first.opened[0].size - 10.0).abs() < 1e-9);

        let second = ledger.mark(&parent.market_id, 0.49, t0 + Duration::minutes(2)).unwrap();
        assert_eq!(second.opened.len(), 1);
        assert_eq!(second.opened[0].pyramid_level, 2);
        assert_eq!(ledger.open_position_count(), 3);

        let closed = ledger
            .close(&parent.id, ExitReason::Manual, "test", t0 + Duration::minutes(3))
            .unwrap();
        assert_eq!(closed.len(), 3);
        assert_eq!(closed[0].exit_reason, ExitReason::Manual);
        assert!(closed[1..].iter().all(|t| t.exit_reason == ExitReason::ParentClosed));
        assert_eq!(ledger.open_position_count(), 0);

        let total: f64 = closed.iter().map(|t| t.pnl).sum();
        assert!((ledger.balance() - (1000.0 + total)).abs() < 1e-9);
    }

    #[test]
    fn insufficient_balance_reduces_then_fails() {
        let ledger = PositionLedger::new(LedgerConfig {
            starting_balance: 30.0,
            ..flat_config()
        });
        let t0 = Utc::now();
        ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.5, 20.0), 20.0, t0)
            .unwrap();
        let reduced = ledger
            .open(&make_signal("e2", Direction::BuyYes, 0.5, 20.0), 20.0, t0)
            .unwrap();
        assert!((reduced.size - 9.0).abs() < 1e-9);

        match ledger.open(&make_signal("e3", Direction::BuyYes, 0.5, 20.0), 20.0, t0) {
            Err(PipelineError::InsufficientBalance { .. }) => {}
            other => panic!("expected insufficient balance, got {:?}", other),
        }
    }

    #[test]
    fn correlated_exposure_is_capped() {
        let ledger = PositionLedger::new(flat_config());
        let t0 = Utc::now();
        let sig = make_signal("e1", Direction::BuyYes, 0.5, 50.0);
        ledger.open(&sig, 50.0, t0).unwrap();
        ledger.open(&sig, 50.0, t0).unwrap();
        match ledger.open(&sig, 10.0, t0) {
            Err(PipelineError::ExposureLimit { existing, .. }) => assert_eq!(existing, 100.0),
            other => panic!("expected exposure limit, got {:?}", other),
        }
    }

    #[test]
    fn sizes_are_clamped_to_position_cap() {
        let ledger = PositionLedger::new(flat_config());
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.5, 80.0), 80.0, Utc::now())
            .unwrap();
        assert_eq!(pos.size, 50.0);
    }

    #[test]
    fn equity_tracks_unrealized_after_every_tick() {
        let ledger = PositionLedger::new(flat_config());
        let t0 = Utc::now();
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.50, 20.0), 20.0, t0)
            .unwrap();
        for (i, price) in [0.51, 0.49, 0.52].iter().enumerate() {
            ledger
                .mark(&pos.market_id, *price, t0 + Duration::seconds(i as i64 + 1))
                .unwrap();
            let unrealized: f64 = ledger.open_positions().iter().map(|p| p.unrealized_pnl).sum();
            assert!((ledger.equity() - (ledger.balance() + unrealized)).abs() < 1e-9);
        }
        assert!((ledger.net_asset_value() - (1000.0 + 20.0 * 0.04)).abs() < 1e-9);
    }

    fn aggressive_flat() -> LedgerConfig {
        LedgerConfig {
            slippage_base: 0.0,
            slippage_size_factor: 0.0,
            ..LedgerConfig::aggressive()
        }
    }

    #[test]
    fn pyramid_refused_while_kill_switch_active() {
        let risk = Arc::new(RiskGate::new(RiskConfig::default()));
        let ledger = PositionLedger::new(aggressive_flat()).with_risk_gate(risk.clone());
        let t0 = Utc::now();
        let parent = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.40, 20.0), 20.0, t0)
            .unwrap();

        // Losses elsewhere trip the kill switch
        let other = Position::from_signal(&make_signal("e2", Direction::BuyYes, 0.5, 50.0), 0.5, 50.0, t0);
        risk.on_open_at(&other, t0);
        risk.on_close_at(&other, -109.9, t0);
        assert!(risk.is_kill_switch_active());

        let out = ledger.mark(&parent.market_id, 0.45, t0 + Duration::minutes(1)).unwrap();
        assert!(out.opened.is_empty(), "no pyramid level may open under the kill switch");
        assert_eq!(ledger.open_position_count(), 1);
        assert_eq!(ledger.position(&parent.id).unwrap().pyramid_triggers, 0);
    }

    #[test]
    fn pyramids_respect_per_key_position_cap() {
        let risk = Arc::new(RiskGate::new(RiskConfig::default()));
        let ledger = PositionLedger::new(aggressive_flat()).with_risk_gate(risk.clone());
        let t0 = Utc::now();
        let parent = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.40, 20.0), 20.0, t0)
            .unwrap();

        for (i, price) in [0.45, 0.49, 0.53].into_iter().enumerate() {
            ledger
                .mark(&parent.market_id, price, t0 + Duration::minutes(i as i64 + 1))
                .unwrap();
        }

        let cap = risk.config().max_positions_per_key;
        assert_eq!(ledger.open_position_count(), cap);
        assert_eq!(
            risk.status(t0).open_by_key.get(&parent.correlation_key),
            Some(&cap)
        );
    }

    #[test]
    fn settlement_feeds_risk_and_adaptive() {
        let risk = Arc::new(RiskGate::new(RiskConfig::default()));
        let adaptive = Arc::new(AdaptiveThresholds::new(AdaptiveConfig::default()));
        let ledger = PositionLedger::new(flat_config())
            .with_risk_gate(risk.clone())
            .with_adaptive(adaptive.clone());
        let t0 = Utc::now();
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.50, 20.0), 20.0, t0)
            .unwrap();
        assert_eq!(risk.status(t0).open_by_key.get(&pos.correlation_key), Some(&1));

        ledger.mark(&pos.market_id, 0.40, t0 + Duration::minutes(1)).unwrap();
        let status = risk.status(t0);
        assert!((status.daily_pnl - (-4.0)).abs() < 1e-9);
        assert_eq!(status.loss_streak, 1);
        assert!(status.open_by_key.is_empty());
        assert_eq!(adaptive.performance("market_only").unwrap().total_trades, 1);
        assert_eq!(ledger.performance_stats().losses, 1);
    }

    #[test]
    fn orphan_child_violates_invariants() {
        let ledger = PositionLedger::new(flat_config());
        let sig = make_signal("e1", Direction::BuyYes, 0.5, 10.0);
        let mut orphan = Position::from_signal(&sig, 0.5, 10.0, Utc::now());
        orphan.parent_id = Some("gone".into());
        ledger.positions.write().unwrap().insert(orphan.id.clone(), orphan);
        assert!(matches!(
            ledger.verify_invariants(),
            Err(PipelineError::InvariantViolation(_))
        ));
    }

    #[test]
    fn state_round_trip_resumes_positions() {
        let temp_dir =
            std::env::temp_dir().join(format!("cascadebot_ledger_{}", uuid::Uuid::new_v4()));
        let state_path = temp_dir.join("ledger_state.json");

        let ledger = PositionLedger::new(flat_config()).with_state_file(state_path.clone());
        let pos = ledger
            .open(&make_signal("e1", Direction::BuyYes, 0.5, 20.0), 20.0, Utc::now())
            .unwrap();

        let risk = Arc::new(RiskGate::default());
        let restored = PositionLedger::new(flat_config())
            .with_risk_gate(risk.clone())
            .with_state_file(state_path);
        restored.load_state().unwrap();
        assert_eq!(restored.balance(), 980.0);
        assert_eq!(restored.position(&pos.id).unwrap().size, 20.0);
        assert_eq!(
            risk.status(Utc::now()).open_by_key.get(&pos.correlation_key),
            Some(&1)
        );

        let _ = fs::remove_dir_all(temp_dir);
    }

    #[test]
    fn load_state_missing_file_keeps_clean_boot_defaults() {
        let temp_dir =
            std::env::temp_dir().join(format!("cascadebot_clean_boot_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&temp_dir).unwrap();
        let state_path = temp_dir.join("ledger_state_missing.json");

        let ledger = PositionLedger::new(LedgerConfig {
            starting_balance: 1234.0,
            ..Default::default()
        })
        .with_state_file(state_path);
        ledger.load_state().unwrap();

        assert_eq!(ledger.balance(), 1234.0);
        assert_eq!(ledger.open_position_count(), 0);
        assert_eq!(ledger.trade_history().len(), 0);
        assert!(ledger.summary_string().contains("$1234.00 bal"));

        let _ = fs::remove_dir_all(temp_dir);
    }
}
