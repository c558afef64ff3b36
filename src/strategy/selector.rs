//! Multi-Signal Selector
//!
//! Turns the raw cascade output into a small diversified candidate list:
//! confidence filter, one signal per correlation key, exposure budget per key,
//! per-scan cap. Output order is the order the risk gate must consume.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::paper_trading::Position;
use crate::types::Signal;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub min_confidence: f64,
    pub max_signals_per_scan: usize,
    /// Existing + new size allowed per correlation key (USD)
    pub max_correlated_exposure_usd: f64,
    /// Confidence bonus for the second and later uncorrelated picks
    pub diversification_bonus: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_signals_per_scan: 5,
            max_correlated_exposure_usd: 100.0,
            diversification_bonus: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectorStats {
    pub total_scans: u64,
    pub total_candidates: u64,
    pub total_selected: u64,
    pub rejected_confidence: u64,
    pub rejected_correlation: u64,
    pub rejected_limit: u64,
    pub max_signals_in_scan: usize,
}

impl SelectorStats {
    pub fn avg_signals_per_scan(&self) -> f64 {
        if self.total_scans == 0 {
            0.0
        } else {
            self.total_selected as f64 / self.total_scans as f64
        }
    }
}

/// Σ open size per correlation key, rebuilt every selection.
pub fn exposure_by_key(open_positions: &[Position]) -> HashMap<String, f64> {
    let mut exposure = HashMap::new();
    for pos in open_positions {
        *exposure.entry(pos.correlation_key.clone()).or_insert(0.0) += pos.size;
    }
    exposure
}

pub struct MultiSignalSelector {
    config: SelectorConfig,
    stats: RwLock<SelectorStats>,
}

impl MultiSignalSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(SelectorStats::default()),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn select(&self, signals: Vec<Signal>, open_positions: &[Position]) -> Vec<Signal> {
        let candidates = signals.len();
        let mut rejected_confidence = 0u64;
        let mut rejected_correlation = 0u64;
        let mut rejected_limit = 0u64;

        let qualified: Vec<Signal> = signals
            .into_iter()
            .filter(|s| {
                let keep = s.confidence >= self.config.min_confidence;
                if !keep {
                    rejected_confidence += 1;
                }
                keep
            })
            .collect();

        let mut exposure = exposure_by_key(open_positions);

        // Best signal per correlation key; the rest are redundant
        let mut best: HashMap<String, Signal> = HashMap::new();
        for signal in qualified {
            match best.get(&signal.correlation_key) {
                Some(current) if current.confidence >= signal.confidence => {
                    rejected_correlation += 1;
                }
                Some(_) => {
                    rejected_correlation += 1;
                    best.insert(signal.correlation_key.clone(), signal);
                }
                None => {
                    best.insert(signal.correlation_key.clone(), signal);
                }
            }
        }

        let mut groups: Vec<Signal> = best.into_values().collect();
        groups.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.correlation_key.cmp(&b.correlation_key))
        });

        let mut selected: Vec<Signal> = Vec::new();
        let mut remaining = groups.into_iter();
        for mut signal in remaining.by_ref() {
            let existing = exposure.get(&signal.correlation_key).copied().unwrap_or(0.0);
            if existing + signal.size_hint > self.config.max_correlated_exposure_usd {
                debug!(
                    key = %signal.correlation_key,
                    existing = %format!("${:.2}", existing),
                    size = %format!("${:.2}", signal.size_hint),
                    "[SELECTOR] Correlated exposure limit"
                );
                rejected_correlation += 1;
                continue;
            }

            *exposure.entry(signal.correlation_key.clone()).or_insert(0.0) += signal.size_hint;
            if !selected.is_empty() {
                signal.confidence =
                    (signal.confidence * (1.0 + self.config.diversification_bonus)).min(1.0);
            }
            selected.push(signal);

            if selected.len() >= self.config.max_signals_per_scan {
                break;
            }
        }
        rejected_limit += remaining.count() as u64;

        if let Ok(mut stats) = self.stats.write() {
            stats.total_scans += 1;
            stats.total_candidates += candidates as u64;
            stats.total_selected += selected.len() as u64;
            stats.rejected_confidence += rejected_confidence;
            stats.rejected_correlation += rejected_correlation;
            stats.rejected_limit += rejected_limit;
            stats.max_signals_in_scan = stats.max_signals_in_scan.max(selected.len());
        }

        if !selected.is_empty() {
            info!(
                selected = selected.len(),
                candidates,
                rejected_confidence,
                rejected_correlation,
                rejected_limit,
                "[SELECTOR] Diversified selection"
            );
        }
        selected
    }

    pub fn stats(&self) -> SelectorStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, MarketSnapshot};

    fn make_signal(market: &str, event: Option<&str>, confidence: f64, size: f64) -> Signal {
        let snapshot = MarketSnapshot {
            market_id: market.into(),
            event_id: event.map(String::from),
            sport: "soccer".into(),
            current_price: 0.4,
            ..Default::default()
        };
        Signal::new("market_only", &snapshot, Direction::BuyYes, 0.4, 0.5, 0.3, confidence, size, "t")
    }

    fn make_position(key: &str, size: f64) -> Position {
        let sig = make_signal("held", None, 0.8, size);
        let mut pos = Position::from_signal(&sig, 0.4, size, chrono::Utc::now());
        pos.correlation_key = key.to_string();
        pos
    }

    #[test]
    fn low_confidence_yields_empty() {
        let selector = MultiSignalSelector::new(SelectorConfig::default());
        let out = selector.select(vec![make_signal("m1", Some("e1"), 0.5, 10.0)], &[]);
        assert!(out.is_empty());
        assert_eq!(selector.stats().rejected_confidence, 1);
    }

    #[test]
    fn keeps_best_of_correlated_pair() {
        let selector = MultiSignalSelector::new(SelectorConfig::default());
        let out = selector.select(
            vec![
                make_signal("m1", Some("e1"), 0.7, 10.0),
                make_signal("m2", Some("e1"), 0.9, 10.0),
            ],
            &[],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].market_id, "m2");
        assert!((out[0].confidence - 0.9).abs() < 1e-9, "first pick gets no bonus");
    }

    #[test]
    fn second_uncorrelated_pick_gets_bonus() {
        let selector = MultiSignalSelector::new(SelectorConfig::default());
        let out = selector.select(
            vec![
                make_signal("m1", Some("e1"), 0.95, 10.0),
                make_signal("m2", Some("e2"), 0.7, 10.0),
            ],
            &[],
        );
        assert_eq!(out.len(), 2);
        assert!((out[0].confidence - 0.95).abs() < 1e-9);
        assert!((out[1].confidence - 0.77).abs() < 1e-9, "got {}", out[1].confidence);
    }

    #[test]
    fn respects_existing_exposure() {
        let selector = MultiSignalSelector::new(SelectorConfig::default());
        let open = vec![make_position("event:e1", 95.0)];
        let out = selector.select(
            vec![
                make_signal("m1", Some("e1"), 0.9, 10.0),
                make_signal("m2", Some("e2"), 0.8, 10.0),
            ],
            &open,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].correlation_key, "event:e2");
        assert_eq!(selector.stats().rejected_correlation, 1);
    }

    #[test]
    fn caps_signals_per_scan_in_confidence_order() {
        let selector = MultiSignalSelector::new(SelectorConfig {
            max_signals_per_scan: 2,
            ..Default::default()
        });
        let signals = (0..4)
            .map(|i| make_signal(&format!("m{}", i), Some(&format!("e{}", i)), 0.6 + 0.1 * i as f64, 5.0))
            .collect();
        let out = selector.select(signals, &[]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].market_id, "m3");
        assert_eq!(out[1].market_id, "m2");
        let stats = selector.stats();
        assert_eq!(stats.rejected_limit, 2);
        assert_eq!(stats.max_signals_in_scan, 2);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let selector = MultiSignalSelector::new(SelectorConfig::default());
        assert!(selector.select(Vec::new(), &[]).is_empty());
        assert_eq!(selector.stats().total_scans, 1);
    }
}
