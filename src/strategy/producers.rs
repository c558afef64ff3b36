//! Reference signal producers
//!
//! Small heuristics that need nothing beyond the market quote, so the
//! pipeline can run end to end without a sports data feed.

use async_trait::async_trait;

use super::{ExitDecision, SignalProducer};
use crate::error::ProducerError;
use crate::paper_trading::Position;
use crate::types::{Direction, MarketSnapshot, ScanContext, Signal};

// ─────────────────────────────────────────────────────────────────
// Market-only
// ─────────────────────────────────────────────────────────────────

/// Fades heavy favourites, buys cheap underdogs and scalps wide 50/50 spreads.
#[derive(Debug, Clone)]
pub struct MarketOnly {
    /// Distance from 0.5 that makes a market a favourite/underdog at multiplier 1.0
    pub edge_distance: f64,
    /// Minimum spread (percent of price) for the scalp setup at multiplier 1.0
    pub min_spread_pct: f64,
    /// Size budget before confidence scaling
    pub base_size_usd: f64,
    pub enabled: bool,
}

impl Default for MarketOnly {
    fn default() -> Self {
        Self {
            edge_distance: 0.25, // favourite >= 0.75, underdog <= 0.25
            min_spread_pct: 3.0,
            base_size_usd: 50.0,
            enabled: true,
        }
    }
}

#[async_trait]
impl SignalProducer for MarketOnly {
    fn name(&self) -> &'static str {
        "market_only"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn analyze(
        &self,
        market: &MarketSnapshot,
        _ctx: &ScanContext,
        threshold_multiplier: f64,
    ) -> Result<Option<Signal>, ProducerError> {
        let price = market.current_price;
        if !(0.0..=1.0).contains(&price) {
            return Err(ProducerError::MissingInput(format!(
                "{} has no usable price ({})",
                market.market_id, price
            )));
        }
        // 0.5 is what sparse feeds report for unknown markets
        if (price - 0.5).abs() < f64::EPSILON {
            return Ok(None);
        }

        let distance = self.edge_distance * threshold_multiplier;
        let favourite = 0.5 + distance;
        let underdog = 0.5 - distance;

        if price >= favourite {
            let confidence = 0.55 + (price - favourite) * 2.0;
            let signal = Signal::new(
                self.name(),
                market,
                Direction::BuyNo,
                price,
                price * 0.97,
                (price * 1.02).min(0.99),
                confidence,
                (self.base_size_usd * 0.3 * 0.55).min(self.base_size_usd),
                format!("Fading favourite at {:.0}%", price * 100.0),
            );
            return Ok(Some(signal));
        }

        if price <= underdog && price > 0.03 {
            let signal = Signal::new(
                self.name(),
                market,
                Direction::BuyYes,
                price,
                price * 1.4,
                price * 0.7,
                0.55,
                self.base_size_usd * 0.25 * 0.5,
                format!("Underdog at {:.1}% for asymmetric upside", price * 100.0),
            );
            return Ok(Some(signal));
        }

        let spread_pct = market.spread.map(|s| s / price * 100.0).unwrap_or(0.0);
        if spread_pct >= self.min_spread_pct * threshold_multiplier && (0.35..=0.65).contains(&price)
        {
            let half = market.spread.unwrap_or(0.0) / 2.0;
            let bid = price - half;
            let ask = price + half;
            let signal = Signal::new(
                self.name(),
                market,
                Direction::BuyYes,
                bid,
                ask * 0.97,
                bid * 0.95,
                0.55,
                self.base_size_usd * 0.25 * 0.55,
                format!("Wide spread scalp ({:.1}%) on 50/50 market", spread_pct),
            );
            return Ok(Some(signal));
        }

        Ok(None)
    }

    fn should_exit(&self, position: &Position, current_price: f64, _ctx: &ScanContext) -> ExitDecision {
        let profit = position.direction.pnl_pct(position.entry_price, current_price);
        let (take, stop, label) = match position.direction {
            Direction::BuyNo => (3.0, -2.0, "Favourite fade"),
            Direction::BuyYes if position.entry_price <= 0.5 - self.edge_distance => {
                (40.0, -35.0, "Underdog value")
            }
            Direction::BuyYes => (3.0, -3.0, "Spread scalp"),
        };
        if profit >= take {
            return ExitDecision::exit(format!("{} profit ({:+.1}%)", label, profit));
        }
        if profit <= stop {
            return ExitDecision::exit(format!("{} stop ({:+.1}%)", label, profit));
        }
        ExitDecision::hold()
    }
}

// ─────────────────────────────────────────────────────────────────
// Overreaction fade
// ─────────────────────────────────────────────────────────────────

/// Fades sharp moves after a game event, betting on partial reversion.
#[derive(Debug, Clone)]
pub struct OverreactionFade {
    /// Minimum absolute move (percent) at multiplier 1.0
    pub min_move_pct: f64,
    /// Expected reversion as a fraction of the move
    pub fade_fraction: f64,
    pub max_hold_minutes: i64,
    pub base_size_usd: f64,
    pub enabled: bool,
}

impl Default for OverreactionFade {
    fn default() -> Self {
        Self {
            min_move_pct: 5.0,
            fade_fraction: 0.5,
            max_hold_minutes: 15,
            base_size_usd: 25.0,
            enabled: true,
        }
    }
}

#[async_trait]
impl SignalProducer for OverreactionFade {
    fn name(&self) -> &'static str {
        "overreaction"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn analyze(
        &self,
        market: &MarketSnapshot,
        ctx: &ScanContext,
        threshold_multiplier: f64,
    ) -> Result<Option<Signal>, ProducerError> {
        // Only fade moves that follow a game event
        if ctx.recent_events.is_empty() || market.previous_price.is_none() {
            return Ok(None);
        }
        let price = market.current_price;
        let change = market.price_change_pct();
        if change.abs() < self.min_move_pct * threshold_multiplier {
            return Ok(None);
        }

        let reversion = change.abs() * self.fade_fraction / 100.0;
        let (direction, target, stop) = if change > 0.0 {
            (Direction::BuyNo, price - reversion, (price * 1.05).min(0.99))
        } else {
            (Direction::BuyYes, price + reversion, price * 0.95)
        };
        let confidence = (change.abs() / 10.0).min(0.8);

        Ok(Some(Signal::new(
            self.name(),
            market,
            direction,
            price,
            target,
            stop,
            confidence,
            self.base_size_usd * confidence,
            format!(
                "Fading {:.1}% move after {}",
                change.abs(),
                ctx.recent_events.last().map(String::as_str).unwrap_or("event")
            ),
        )))
    }

    fn should_exit(&self, position: &Position, current_price: f64, ctx: &ScanContext) -> ExitDecision {
        let held = ctx.taken_at - position.opened_at;
        if held > chrono::Duration::minutes(self.max_hold_minutes) {
            return ExitDecision::exit(format!(
                "Max fade hold reached ({} min)",
                self.max_hold_minutes
            ));
        }
        let profit = position.direction.pnl_pct(position.entry_price, current_price);
        if profit >= 10.0 {
            return ExitDecision::exit(format!("Fade target hit ({:+.1}%)", profit));
        }
        if profit <= -5.0 {
            return ExitDecision::exit(format!("Fade stop hit ({:+.1}%)", profit));
        }
        ExitDecision::hold()
    }
}
