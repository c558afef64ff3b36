//! Cascade Controller
//!
//! Sweeps every enabled producer tier by tier (Critical → Low). If a full
//! sweep finds nothing, the cascade threshold is multiplied by the decay
//! factor and the sweep repeats, up to `max_retries` loosened sweeps. The
//! first non-empty sweep wins.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AdaptiveThresholds, SignalProducer};
use crate::error::PipelineError;
use crate::types::{MarketSnapshot, ScanContext, Signal, StrategyTier};

#[derive(Debug, Clone)]
pub struct CascadeConfig {
    /// Multiplier applied after an empty sweep (< 1.0 loosens)
    pub threshold_decay: f64,
    /// Loosened sweeps allowed after the first
    pub max_retries: u32,
    /// Per-producer call timeout; a timeout counts as "no signal"
    pub producer_timeout: Duration,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            threshold_decay: 0.8,
            max_retries: 3,
            producer_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CascadeStats {
    pub total_scans: u64,
    pub signals_found: u64,
    /// Scans that needed at least one loosened sweep
    pub retries_needed: u64,
    pub threshold_reductions: u64,
    pub producer_errors: u64,
    pub producer_timeouts: u64,
    pub last_multiplier: f64,
    pub signals_by_strategy: HashMap<String, u64>,
}

/// Result of one cascade run
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    pub signals: Vec<Signal>,
    /// Full sweeps performed (1 ..= max_retries + 1)
    pub sweeps: u32,
    /// Cascade multiplier of the last sweep
    pub cascade_multiplier: f64,
    /// Isolated producer failures, already logged
    pub errors: Vec<PipelineError>,
}

pub struct CascadeController {
    config: CascadeConfig,
    producers: Vec<Arc<dyn SignalProducer>>,
    adaptive: Arc<AdaptiveThresholds>,
    stats: RwLock<CascadeStats>,
}

impl CascadeController {
    pub fn new(config: CascadeConfig, adaptive: Arc<AdaptiveThresholds>) -> Self {
        Self {
            config,
            producers: Vec::new(),
            adaptive,
            stats: RwLock::new(CascadeStats {
                last_multiplier: 1.0,
                ..Default::default()
            }),
        }
    }

    pub fn with_producer(mut self, producer: Arc<dyn SignalProducer>) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn with_producers(mut self, producers: Vec<Arc<dyn SignalProducer>>) -> Self {
        self.producers.extend(producers);
        self
    }

    pub fn producers(&self) -> &[Arc<dyn SignalProducer>] {
        &self.producers
    }

    pub fn producer(&self, name: &str) -> Option<Arc<dyn SignalProducer>> {
        self.producers.iter().find(|p| p.name() == name).cloned()
    }

    /// Gather signals for this cycle.
    pub async fn run(&self, markets: &[MarketSnapshot], ctx: &ScanContext) -> Vec<Signal> {
        self.run_detailed(markets, ctx).await.signals
    }

    pub async fn run_detailed(&self, markets: &[MarketSnapshot], ctx: &ScanContext) -> CascadeOutcome {
        let mut cascade_multiplier = 1.0;
        let mut outcome = CascadeOutcome::default();
        let mut retry = 0u32;

        loop {
            outcome.sweeps += 1;
            let (signals, errors) = self.sweep(markets, ctx, cascade_multiplier).await;
            outcome.errors.extend(errors);

            if !signals.is_empty() {
                outcome.signals = signals;
                break;
            }
            if retry >= self.config.max_retries {
                break;
            }
            retry += 1;
            cascade_multiplier *= self.config.threshold_decay;
            debug!(
                retry,
                multiplier = %format!("{:.3}", cascade_multiplier),
                "[CASCADE] Empty sweep, loosening thresholds"
            );
        }
        outcome.cascade_multiplier = cascade_multiplier;

        self.record(&outcome, retry);

        if !outcome.signals.is_empty() {
            info!(
                signals = outcome.signals.len(),
                sweeps = outcome.sweeps,
                multiplier = %format!("{:.3}", cascade_multiplier),
                "[CASCADE] Signals found"
            );
        } else {
            debug!(sweeps = outcome.sweeps, "[CASCADE] No signals after all retries");
        }
        outcome
    }

    /// One full pass over every tier at `cascade_multiplier`.
    async fn sweep(
        &self,
        markets: &[MarketSnapshot],
        ctx: &ScanContext,
        cascade_multiplier: f64,
    ) -> (Vec<Signal>, Vec<PipelineError>) {
        let mut signals = Vec::new();
        let mut errors = Vec::new();

        for tier in StrategyTier::ALL {
            let active: Vec<&Arc<dyn SignalProducer>> = self
                .producers
                .iter()
                .filter(|p| p.tier() == tier && p.enabled())
                .collect();
            if active.is_empty() {
                continue;
            }

            let calls = active.iter().flat_map(|producer| {
                let multiplier = cascade_multiplier * self.adaptive.get_multiplier(producer.name());
                markets
                    .iter()
                    .map(move |market| self.call_producer(producer, market, ctx, multiplier))
            });

            for result in join_all(calls).await {
                match result {
                    Ok(Some(signal)) => signals.push(signal),
                    Ok(None) => {}
                    Err(e) => errors.push(e),
                }
            }
        }
        (signals, errors)
    }

    async fn call_producer(
        &self,
        producer: &Arc<dyn SignalProducer>,
        market: &MarketSnapshot,
        ctx: &ScanContext,
        multiplier: f64,
    ) -> Result<Option<Signal>, PipelineError> {
        let strategy = producer.name();
        let call = producer.analyze(market, ctx, multiplier);
        match tokio::time::timeout(self.config.producer_timeout, call).await {
            Ok(Ok(Some(signal))) => match signal.normalized() {
                Ok(signal) => Ok(Some(signal)),
                Err(source) => {
                    warn!(strategy, market = %market.market_id, error = %source, "[CASCADE] Dropping malformed signal");
                    Err(PipelineError::Producer {
                        strategy: strategy.to_string(),
                        source,
                    })
                }
            },
            Ok(Ok(None)) => Ok(None),
            Ok(Err(source)) => {
                warn!(strategy, market = %market.market_id, error = %source, "[CASCADE] Producer error");
                Err(PipelineError::Producer {
                    strategy: strategy.to_string(),
                    source,
                })
            }
            Err(_) => {
                let timeout_ms = self.config.producer_timeout.as_millis() as u64;
                warn!(strategy, market = %market.market_id, timeout_ms, "[CASCADE] Producer timed out");
                Err(PipelineError::ProducerTimeout {
                    strategy: strategy.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    fn record(&self, outcome: &CascadeOutcome, retries: u32) {
        if let Ok(mut stats) = self.stats.write() {
            stats.total_scans += 1;
            stats.threshold_reductions += retries as u64;
            if retries > 0 {
                stats.retries_needed += 1;
            }
            stats.last_multiplier = outcome.cascade_multiplier;
            stats.signals_found += outcome.signals.len() as u64;
            for signal in &outcome.signals {
                *stats
                    .signals_by_strategy
                    .entry(signal.strategy_id.clone())
                    .or_insert(0) += 1;
            }
            for err in &outcome.errors {
                match err {
                    PipelineError::ProducerTimeout { .. } => stats.producer_timeouts += 1,
                    _ => stats.producer_errors += 1,
                }
            }
        }
    }

    pub fn stats(&self) -> CascadeStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }
}
