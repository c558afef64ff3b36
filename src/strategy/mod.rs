//! Strategy layer
//!
//! Implements:
//! - `SignalProducer` trait consumed polymorphically by the cascade
//! - Cascade controller (tiered, threshold-relaxing sweeps)
//! - Adaptive per-strategy threshold multipliers
//! - Multi-signal diversified selector
//! - Reference producers (market-only heuristics, overreaction fade)

pub mod adaptive;
pub mod cascade;
pub mod producers;
pub mod selector;

pub use adaptive::{AdaptiveConfig, AdaptiveStats, AdaptiveThresholds};
pub use cascade::{CascadeConfig, CascadeController, CascadeStats};
pub use producers::{MarketOnly, OverreactionFade};
pub use selector::{MultiSignalSelector, SelectorConfig, SelectorStats};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ProducerError;
use crate::paper_trading::Position;
use crate::types::{MarketSnapshot, ScanContext, Signal, StrategyTier};

/// Producer verdict on an open position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub exit: bool,
    pub reason: String,
}

impl ExitDecision {
    pub fn hold() -> Self {
        Self {
            exit: false,
            reason: String::new(),
        }
    }

    pub fn exit(reason: impl Into<String>) -> Self {
        Self {
            exit: true,
            reason: reason.into(),
        }
    }
}

/// A pluggable heuristic that turns one market snapshot into at most one signal.
///
/// Producers only read their inputs. `threshold_multiplier` < 1.0 asks the
/// producer to accept weaker setups (cascade retries, adaptive loosening).
#[async_trait]
pub trait SignalProducer: Send + Sync {
    /// Strategy id; also keys adaptive thresholds and per-strategy stats.
    fn name(&self) -> &'static str;

    fn tier(&self) -> StrategyTier {
        StrategyTier::for_strategy(self.name())
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn analyze(
        &self,
        market: &MarketSnapshot,
        ctx: &ScanContext,
        threshold_multiplier: f64,
    ) -> Result<Option<Signal>, ProducerError>;

    fn should_exit(&self, position: &Position, current_price: f64, ctx: &ScanContext)
        -> ExitDecision;
}

/// Build the registered producer set from names. Empty means every built-in.
pub fn builtin_producers(names: &[String]) -> Vec<Arc<dyn SignalProducer>> {
    let all: Vec<Arc<dyn SignalProducer>> = vec![
        Arc::new(OverreactionFade::default()),
        Arc::new(MarketOnly::default()),
    ];
    if names.is_empty() {
        return all;
    }
    all.into_iter()
        .filter(|p| names.iter().any(|n| n == p.name()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_producers_filter_by_name() {
        assert_eq!(builtin_producers(&[]).len(), 2);
        let only = builtin_producers(&["market_only".to_string()]);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name(), "market_only");
        assert_eq!(only[0].tier(), StrategyTier::Medium);
    }
}
