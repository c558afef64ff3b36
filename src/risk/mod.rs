//! Risk Gate - admission control and stress-adjusted sizing
//!
//! Implements:
//! - Daily loss kill switch (holds until the daily reset)
//! - Loss-streak pause with fixed duration
//! - Open-position, hourly-trade and per-correlation-key caps
//! - Confidence floor and absolute size cap
//! - Sizing penalties for loss streaks and proximity to the daily loss limit

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;
use tracing::{error, info, warn};

use crate::paper_trading::Position;
use crate::types::Signal;

const MAX_PNL_HISTORY: usize = 100;

/// Risk configuration
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Absolute per-position cap (USD)
    pub max_position_usd: f64,
    /// Smallest tradable size (USD)
    pub min_position_usd: f64,
    /// Daily loss that trips the kill switch (USD)
    pub max_daily_loss_usd: f64,
    pub max_open_positions: usize,
    pub max_hourly_trades: usize,
    /// Consecutive losses before pausing
    pub loss_streak_limit: u32,
    pub pause_duration: Duration,
    /// Open positions allowed per correlation key
    pub max_positions_per_key: usize,
    /// Minimum confidence to admit
    pub min_confidence: f64,
    /// Fraction of the daily loss limit that raises a warning
    pub daily_loss_warning_ratio: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_usd: 50.0,
            min_position_usd: 1.0,
            max_daily_loss_usd: 100.0,
            max_open_positions: 10,
            max_hourly_trades: 20,
            loss_streak_limit: 5,
            pause_duration: Duration::hours(1),
            max_positions_per_key: 2,
            min_confidence: 0.5,
            daily_loss_warning_ratio: 0.8,
        }
    }
}

/// Gate state derived from `RiskState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateState {
    Normal,
    Paused,
    Killed,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Normal => write!(f, "NORMAL"),
            GateState::Paused => write!(f, "PAUSED"),
            GateState::Killed => write!(f, "KILLED"),
        }
    }
}

/// Why a signal was not admitted. Normal control flow, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    KillSwitch { daily_pnl: f64, limit: f64 },
    Paused { until: DateTime<Utc> },
    MaxOpenPositions { open: usize, max: usize },
    HourlyLimit { trades: usize, max: usize },
    CorrelationLimit { key: String, open: usize, max: usize },
    LowConfidence { confidence: f64, min: f64 },
    SizeAboveCap { size: f64, max: f64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::KillSwitch { daily_pnl, limit } => write!(
                f,
                "kill switch: daily pnl ${:.2} at or below -${:.2}",
                daily_pnl, limit
            ),
            RejectReason::Paused { until } => {
                write!(f, "paused after loss streak until {}", until.format("%H:%M:%S"))
            }
            RejectReason::MaxOpenPositions { open, max } => {
                write!(f, "max open positions reached ({}/{})", open, max)
            }
            RejectReason::HourlyLimit { trades, max } => {
                write!(f, "hourly trade limit reached ({}/{})", trades, max)
            }
            RejectReason::CorrelationLimit { key, open, max } => {
                write!(f, "correlation limit for {} ({}/{})", key, open, max)
            }
            RejectReason::LowConfidence { confidence, min } => {
                write!(f, "confidence {:.2} below floor {:.2}", confidence, min)
            }
            RejectReason::SizeAboveCap { size, max } => {
                write!(f, "requested size ${:.2} above cap ${:.2}", size, max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// `(admitted, reason)`; the reason is empty when admitted.
    pub fn into_parts(self) -> (bool, String) {
        match self {
            Admission::Admitted => (true, String::new()),
            Admission::Rejected(reason) => (false, reason.to_string()),
        }
    }
}

/// High-priority condition surfaced to notifications
#[derive(Debug, Clone, PartialEq)]
pub struct RiskWarning {
    pub state: GateState,
    pub message: String,
}

/// Process-wide mutable risk state. Only `RiskGate` touches it.
#[derive(Debug, Clone, Serialize)]
pub struct RiskState {
    pub trading_day: String,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub hourly_trade_count: usize,
    pub hour_bucket_start: DateTime<Utc>,
    pub loss_streak: u32,
    pub pause_until: Option<DateTime<Utc>>,
    pub open_by_key: HashMap<String, usize>,
    daily_loss_warned: bool,
}

impl RiskState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            trading_day: date_key(now),
            daily_pnl: 0.0,
            daily_trades: 0,
            daily_wins: 0,
            daily_losses: 0,
            hourly_trade_count: 0,
            hour_bucket_start: now,
            loss_streak: 0,
            pause_until: None,
            open_by_key: HashMap::new(),
            daily_loss_warned: false,
        }
    }

    fn roll_hour(&mut self, now: DateTime<Utc>) {
        if now - self.hour_bucket_start >= Duration::hours(1) {
            self.hourly_trade_count = 0;
            self.hour_bucket_start = now;
        }
    }
}

/// Snapshot for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub state: GateState,
    pub kill_switch_active: bool,
    pub paused: bool,
    pub trading_day: String,
    pub daily_pnl: f64,
    pub daily_loss_limit: f64,
    pub daily_trades: u32,
    pub loss_streak: u32,
    pub hourly_trades: usize,
    pub pause_until: Option<DateTime<Utc>>,
    pub open_by_key: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PnlEntry {
    pub strategy_id: String,
    pub correlation_key: String,
    pub pnl: f64,
    pub at: DateTime<Utc>,
}

/// Final admission control in front of the ledger
pub struct RiskGate {
    config: RiskConfig,
    state: RwLock<RiskState>,
    history: RwLock<VecDeque<PnlEntry>>,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RiskState::new(Utc::now())),
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn can_open(&self, signal: &Signal, open_positions: &[Position]) -> Admission {
        self.can_open_at(signal, open_positions, Utc::now())
    }

    /// Admission checks in fixed order; the first failure wins.
    pub fn can_open_at(
        &self,
        signal: &Signal,
        open_positions: &[Position],
        now: DateTime<Utc>,
    ) -> Admission {
        self.admit(
            &signal.correlation_key,
            signal.confidence,
            signal.size_hint,
            open_positions.len(),
            now,
        )
    }

    /// Admission for a pyramid level under `parent`. Same checks as a fresh
    /// open, with the child inheriting the parent's key and confidence.
    pub fn can_add_at(
        &self,
        parent: &Position,
        size: f64,
        open_count: usize,
        now: DateTime<Utc>,
    ) -> Admission {
        self.admit(&parent.correlation_key, parent.confidence, size, open_count, now)
    }

    fn admit(
        &self,
        correlation_key: &str,
        confidence: f64,
        size: f64,
        open_count: usize,
        now: DateTime<Utc>,
    ) -> Admission {
        let Ok(mut state) = self.state.write() else {
            error!("[RISK] State lock poisoned, refusing to admit");
            return Admission::Rejected(RejectReason::KillSwitch {
                daily_pnl: f64::NAN,
                limit: self.config.max_daily_loss_usd,
            });
        };

        if state.daily_pnl <= -self.config.max_daily_loss_usd {
            return Admission::Rejected(RejectReason::KillSwitch {
                daily_pnl: state.daily_pnl,
                limit: self.config.max_daily_loss_usd,
            });
        }

        if let Some(until) = state.pause_until {
            if now < until {
                return Admission::Rejected(RejectReason::Paused { until });
            }
        }

        if open_count >= self.config.max_open_positions {
            return Admission::Rejected(RejectReason::MaxOpenPositions {
                open: open_count,
                max: self.config.max_open_positions,
            });
        }

        state.roll_hour(now);
        if state.hourly_trade_count >= self.config.max_hourly_trades {
            return Admission::Rejected(RejectReason::HourlyLimit {
                trades: state.hourly_trade_count,
                max: self.config.max_hourly_trades,
            });
        }

        let open_for_key = state
            .open_by_key
            .get(correlation_key)
            .copied()
            .unwrap_or(0);
        if open_for_key >= self.config.max_positions_per_key {
            return Admission::Rejected(RejectReason::CorrelationLimit {
                key: correlation_key.to_string(),
                open: open_for_key,
                max: self.config.max_positions_per_key,
            });
        }

        if confidence < self.config.min_confidence {
            return Admission::Rejected(RejectReason::LowConfidence {
                confidence,
                min: self.config.min_confidence,
            });
        }

        if size > self.config.max_position_usd {
            return Admission::Rejected(RejectReason::SizeAboveCap {
                size,
                max: self.config.max_position_usd,
            });
        }

        Admission::Admitted
    }

    /// Stress-adjusted size for an admitted signal, clamped to [min, max].
    pub fn size_for(&self, signal: &Signal) -> f64 {
        let (streak, daily_pnl) = self
            .state
            .read()
            .map(|s| (s.loss_streak, s.daily_pnl))
            .unwrap_or((0, 0.0));

        let mut size = signal.size_hint;

        let streak_multiplier = (1.0 - 0.1 * streak as f64).max(0.5);
        size *= streak_multiplier;

        if daily_pnl < 0.0 && self.config.max_daily_loss_usd > 0.0 {
            let limit_multiplier =
                (1.0 - daily_pnl.abs() / self.config.max_daily_loss_usd).max(0.3);
            size *= limit_multiplier;
        }

        size *= signal.confidence;

        size.min(self.config.max_position_usd)
            .max(self.config.min_position_usd)
    }

    pub fn on_open(&self, position: &Position) {
        self.on_open_at(position, Utc::now())
    }

    pub fn on_open_at(&self, position: &Position, now: DateTime<Utc>) {
        if let Ok(mut state) = self.state.write() {
            state.roll_hour(now);
            state.hourly_trade_count += 1;
            state.daily_trades += 1;
            *state
                .open_by_key
                .entry(position.correlation_key.clone())
                .or_insert(0) += 1;
        }
    }

    /// Re-register a position restored from a state file. Counts it against
    /// its correlation key without touching the hourly budget.
    pub fn restore_open(&self, position: &Position) {
        if let Ok(mut state) = self.state.write() {
            *state
                .open_by_key
                .entry(position.correlation_key.clone())
                .or_insert(0) += 1;
        }
    }

    pub fn on_close(&self, position: &Position, pnl: f64) -> Vec<RiskWarning> {
        self.on_close_at(position, pnl, Utc::now())
    }

    /// Book a realized pnl. Returns warnings for state transitions.
    pub fn on_close_at(&self, position: &Position, pnl: f64, now: DateTime<Utc>) -> Vec<RiskWarning> {
        let mut warnings = Vec::new();
        let Ok(mut state) = self.state.write() else {
            error!("[RISK] State lock poisoned, close not booked");
            return warnings;
        };

        let was_killed = state.daily_pnl <= -self.config.max_daily_loss_usd;
        state.daily_pnl += pnl;

        if let Some(count) = state.open_by_key.get_mut(&position.correlation_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.open_by_key.remove(&position.correlation_key);
            }
        }

        if pnl > 0.0 {
            state.loss_streak = 0;
            state.daily_wins += 1;
        } else {
            state.loss_streak += 1;
            state.daily_losses += 1;
            if state.loss_streak >= self.config.loss_streak_limit {
                let until = now + self.config.pause_duration;
                state.pause_until = Some(until);
                warn!(
                    streak = state.loss_streak,
                    until = %until,
                    "[RISK] Loss streak limit hit, pausing new entries"
                );
                warnings.push(RiskWarning {
                    state: GateState::Paused,
                    message: format!(
                        "{} consecutive losses, trading paused until {}",
                        state.loss_streak,
                        until.format("%H:%M:%S UTC")
                    ),
                });
            }
        }

        let limit = self.config.max_daily_loss_usd;
        if !was_killed && state.daily_pnl <= -limit {
            error!(
                daily_pnl = %format!("${:.2}", state.daily_pnl),
                limit = %format!("${:.2}", limit),
                "[RISK] KILL SWITCH ACTIVATED"
            );
            warnings.push(RiskWarning {
                state: GateState::Killed,
                message: format!(
                    "Kill switch active: daily pnl ${:.2} reached the -${:.2} limit",
                    state.daily_pnl, limit
                ),
            });
        } else if !state.daily_loss_warned
            && state.daily_pnl <= -limit * self.config.daily_loss_warning_ratio
        {
            state.daily_loss_warned = true;
            warnings.push(RiskWarning {
                state: GateState::Normal,
                message: format!(
                    "Daily loss ${:.2} is {:.0}% of the ${:.2} limit",
                    state.daily_pnl.abs(),
                    state.daily_pnl.abs() / limit * 100.0,
                    limit
                ),
            });
        }
        drop(state);

        if let Ok(mut history) = self.history.write() {
            history.push_back(PnlEntry {
                strategy_id: position.strategy_id.clone(),
                correlation_key: position.correlation_key.clone(),
                pnl,
                at: now,
            });
            while history.len() > MAX_PNL_HISTORY {
                history.pop_front();
            }
        }
        warnings
    }

    /// Start a new trading day: clears pnl, counters, streak and pause.
    /// Open-position counts per key survive since the positions do.
    pub fn reset_daily(&self) {
        self.reset_daily_at(Utc::now())
    }

    pub fn reset_daily_at(&self, now: DateTime<Utc>) {
        if let Ok(mut state) = self.state.write() {
            let open_by_key = std::mem::take(&mut state.open_by_key);
            *state = RiskState::new(now);
            state.open_by_key = open_by_key;
            info!(day = %state.trading_day, "[RISK] Daily risk state reset");
        }
    }

    /// Reset when the UTC date changed. Returns true if a reset happened.
    pub fn roll_day(&self, now: DateTime<Utc>) -> bool {
        let current = self
            .state
            .read()
            .map(|s| s.trading_day.clone())
            .unwrap_or_default();
        if current != date_key(now) {
            self.reset_daily_at(now);
            true
        } else {
            false
        }
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.state
            .read()
            .map(|s| s.daily_pnl <= -self.config.max_daily_loss_usd)
            .unwrap_or(true)
    }

    pub fn gate_state(&self, now: DateTime<Utc>) -> GateState {
        self.status(now).state
    }

    pub fn status(&self, now: DateTime<Utc>) -> RiskStatus {
        let state = match self.state.read() {
            Ok(s) => s.clone(),
            Err(_) => RiskState::new(now),
        };
        let killed = state.daily_pnl <= -self.config.max_daily_loss_usd;
        let paused = state.pause_until.map(|u| now < u).unwrap_or(false);
        let gate = if killed {
            GateState::Killed
        } else if paused {
            GateState::Paused
        } else {
            GateState::Normal
        };
        RiskStatus {
            state: gate,
            kill_switch_active: killed,
            paused,
            trading_day: state.trading_day,
            daily_pnl: state.daily_pnl,
            daily_loss_limit: self.config.max_daily_loss_usd,
            daily_trades: state.daily_trades,
            loss_streak: state.loss_streak,
            hourly_trades: state.hourly_trade_count,
            pause_until: state.pause_until,
            open_by_key: state.open_by_key,
        }
    }

    pub fn recent_pnl(&self) -> Vec<PnlEntry> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn risk_report(&self, now: DateTime<Utc>) -> String {
        let status = self.status(now);
        let recent = self.recent_pnl();
        let recent_wins = recent.iter().filter(|e| e.pnl > 0.0).count();
        format!(
            "Risk: {} | day {} pnl ${:+.2} / -${:.0} | streak {} | {}/h trades | recent {}/{} wins",
            status.state,
            status.trading_day,
            status.daily_pnl,
            status.daily_loss_limit,
            status.loss_streak,
            status.hourly_trades,
            recent_wins,
            recent.len()
        )
    }
}

impl Default for RiskGate {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}

/// Get date key for daily grouping
fn date_key(dt: DateTime<Utc>) -> String {
    format!("{}-{:02}-{:02}", dt.year(), dt.month(), dt.day())
}
