//! Alert notifications
//!
//! Events are delivered fire-and-forget on the runtime so a slow or failing
//! channel never blocks the decision or mark loops.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::paper_trading::Position;
use crate::risk::{GateState, RiskWarning};
use crate::types::{ClosedTrade, Direction, ExitReason, Signal};

#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    SignalFound {
        strategy: String,
        market_id: String,
        direction: Direction,
        confidence: f64,
        rationale: String,
    },
    PositionOpened {
        position_id: String,
        market_id: String,
        strategy: String,
        direction: Direction,
        entry_price: f64,
        size: f64,
    },
    PositionClosed {
        position_id: String,
        market_id: String,
        strategy: String,
        reason: ExitReason,
        pnl: f64,
        pnl_pct: f64,
        balance_after: f64,
    },
    RiskWarning {
        state: GateState,
        message: String,
    },
    Summary {
        text: String,
    },
    BotStatus {
        status: String,
        detail: String,
    },
}

impl AlertEvent {
    pub fn signal_found(signal: &Signal) -> Self {
        AlertEvent::SignalFound {
            strategy: signal.strategy_id.clone(),
            market_id: signal.market_id.clone(),
            direction: signal.direction,
            confidence: signal.confidence,
            rationale: signal.rationale.clone(),
        }
    }

    pub fn position_opened(position: &Position) -> Self {
        AlertEvent::PositionOpened {
            position_id: position.id.clone(),
            market_id: position.market_id.clone(),
            strategy: position.strategy_id.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            size: position.size,
        }
    }

    pub fn position_closed(trade: &ClosedTrade) -> Self {
        AlertEvent::PositionClosed {
            position_id: trade.id.clone(),
            market_id: trade.market_id.clone(),
            strategy: trade.strategy_id.clone(),
            reason: trade.exit_reason,
            pnl: trade.pnl,
            pnl_pct: trade.pnl_pct,
            balance_after: trade.balance_after,
        }
    }

    pub fn risk_warning(warning: &RiskWarning) -> Self {
        AlertEvent::RiskWarning {
            state: warning.state,
            message: warning.message.clone(),
        }
    }

    pub fn bot_status(status: impl Into<String>, detail: impl Into<String>) -> Self {
        AlertEvent::BotStatus {
            status: status.into(),
            detail: detail.into(),
        }
    }

    /// Kill switch and pause transitions are high priority
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            AlertEvent::RiskWarning {
                state: GateState::Killed | GateState::Paused,
                ..
            }
        )
    }

    pub fn title(&self) -> &'static str {
        match self {
            AlertEvent::SignalFound { .. } => "Signal found",
            AlertEvent::PositionOpened { .. } => "Position opened",
            AlertEvent::PositionClosed { .. } => "Position closed",
            AlertEvent::RiskWarning { .. } => "Risk warning",
            AlertEvent::Summary { .. } => "Summary",
            AlertEvent::BotStatus { .. } => "Bot status",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AlertEvent::SignalFound {
                strategy,
                market_id,
                direction,
                confidence,
                rationale,
            } => format!(
                "{} {} on {} ({:.0}% conf): {}",
                strategy,
                direction,
                market_id,
                confidence * 100.0,
                rationale
            ),
            AlertEvent::PositionOpened {
                market_id,
                strategy,
                direction,
                entry_price,
                size,
                ..
            } => format!(
                "{} {} {} @ {:.4} for ${:.2}",
                strategy, direction, market_id, entry_price, size
            ),
            AlertEvent::PositionClosed {
                market_id,
                strategy,
                reason,
                pnl,
                pnl_pct,
                balance_after,
                ..
            } => format!(
                "{} {} closed by {}: ${:+.2} ({:+.1}%) | balance ${:.2}",
                strategy, market_id, reason, pnl, pnl_pct, balance_after
            ),
            AlertEvent::RiskWarning { state, message } => format!("[{}] {}", state, message),
            AlertEvent::Summary { text } => text.clone(),
            AlertEvent::BotStatus { status, detail } => format!("{}: {}", status, detail),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}

/// Renders alerts through tracing
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let title = event.title();
        let message = event.message();
        if event.is_high_priority() {
            error!(%title, %message, "🚨 alert raised");
        } else if matches!(event, AlertEvent::RiskWarning { .. }) {
            warn!(%title, %message, "⚠️ alert raised");
        } else {
            info!(%title, %message, "alert raised");
        }
        Ok(())
    }
}

/// Deliver `event` on a detached task. Failures are logged and dropped.
pub fn dispatch(notifier: &Arc<dyn Notifier>, event: AlertEvent) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!(title = event.title(), "No runtime, alert dropped");
        return;
    };
    let notifier = Arc::clone(notifier);
    handle.spawn(async move {
        if let Err(e) = notifier.notify(&event).await {
            warn!(error = %e, title = event.title(), "Failed to deliver alert");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketSnapshot;

    #[test]
    fn risk_warnings_for_kill_and_pause_are_high_priority() {
        let killed = AlertEvent::risk_warning(&RiskWarning {
            state: GateState::Killed,
            message: "limit".into(),
        });
        let near = AlertEvent::risk_warning(&RiskWarning {
            state: GateState::Normal,
            message: "80%".into(),
        });
        assert!(killed.is_high_priority());
        assert!(!near.is_high_priority());
        assert_eq!(killed.message(), "[KILLED] limit");
    }

    #[test]
    fn signal_message_mentions_strategy_and_market() {
        let market = MarketSnapshot {
            market_id: "m-7".into(),
            sport: "tennis".into(),
            current_price: 0.2,
            ..Default::default()
        };
        let signal = Signal::new("market_only", &market, Direction::BuyYes, 0.2, 0.28, 0.14, 0.55, 6.0, "Underdog");
        let msg = AlertEvent::signal_found(&signal).message();
        assert!(msg.contains("market_only"));
        assert!(msg.contains("m-7"));
        assert!(msg.contains("BUY_YES"));
    }

    #[test]
    fn log_notifier_never_fails() {
        let notifier = LogNotifier;
        let event = AlertEvent::bot_status("STARTED", "test");
        assert!(tokio_test::block_on(notifier.notify(&event)).is_ok());
    }

    #[test]
    fn dispatch_without_runtime_is_a_no_op() {
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        dispatch(&notifier, AlertEvent::Summary { text: "x".into() });
    }
}
