//! Pipeline engine
//!
//! Owns every component for the lifetime of the process and drives two loops:
//! the decision cycle (feed → cascade → selector → risk → ledger) and the
//! faster mark loop (ticks → ledger exits → feedback into risk and adaptive).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::{dispatch, AlertEvent, LogNotifier, Notifier};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::feed::{JsonFileFeed, MarketFeed};
use crate::paper_trading::{Position, PositionLedger};
use crate::persistence::{CsvPersistence, MemoryStore, TradeStore};
use crate::risk::{Admission, RiskGate};
use crate::strategy::{builtin_producers, AdaptiveThresholds, CascadeController, MultiSignalSelector};
use crate::types::{ClosedTrade, ExitReason, ScanContext};

/// Closed trades replayed into the adaptive store at startup
const WARM_START_TRADES: usize = 500;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub scan_interval: Duration,
    pub mark_interval: Duration,
    pub summary_interval: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            mark_interval: Duration::from_secs(5),
            summary_interval: chrono::Duration::hours(4),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            scan_interval: cfg.scan_interval(),
            mark_interval: cfg.mark_interval(),
            summary_interval: chrono::Duration::hours(cfg.engine.summary_interval_hours.max(1) as i64),
        }
    }
}

/// Everything the engine wires together
pub struct EngineParts {
    pub settings: EngineSettings,
    pub feed: Arc<dyn MarketFeed>,
    pub cascade: CascadeController,
    pub adaptive: Arc<AdaptiveThresholds>,
    pub selector: MultiSignalSelector,
    pub risk: Arc<RiskGate>,
    pub ledger: Arc<PositionLedger>,
    pub store: Arc<dyn TradeStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// What one decision cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Another cycle was still running
    pub skipped: bool,
    pub markets: usize,
    pub signals_found: usize,
    pub selected: usize,
    pub opened: Vec<Position>,
    /// (market_id, reason) for every selected signal that did not open
    pub rejected: Vec<(String, String)>,
    pub producer_errors: usize,
}

/// What one mark pass did
#[derive(Debug, Clone, Default)]
pub struct MarkReport {
    pub ticks: usize,
    pub closed: Vec<ClosedTrade>,
    pub opened: Vec<Position>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub cycles_aborted: u64,
    pub signals_found: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub rejections: u64,
    pub persistence_failures: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

pub struct Engine {
    settings: EngineSettings,
    feed: Arc<dyn MarketFeed>,
    cascade: CascadeController,
    adaptive: Arc<AdaptiveThresholds>,
    selector: MultiSignalSelector,
    risk: Arc<RiskGate>,
    ledger: Arc<PositionLedger>,
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    /// Single-flight guard for the decision cycle
    cycle_guard: Mutex<()>,
    stats: RwLock<EngineStats>,
    /// Game events from the latest snapshot, reused by producer exit checks
    recent_events: RwLock<Vec<String>>,
    last_summary_at: RwLock<DateTime<Utc>>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            settings: parts.settings,
            feed: parts.feed,
            cascade: parts.cascade,
            adaptive: parts.adaptive,
            selector: parts.selector,
            risk: parts.risk,
            ledger: parts.ledger,
            store: parts.store,
            notifier: parts.notifier,
            cycle_guard: Mutex::new(()),
            stats: RwLock::new(EngineStats::default()),
            recent_events: RwLock::new(Vec::new()),
            last_summary_at: RwLock::new(Utc::now()),
        }
    }

    /// Build the full pipeline from configuration and restore ledger state.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let adaptive = Arc::new(AdaptiveThresholds::new(cfg.into()));
        let risk = Arc::new(RiskGate::new(cfg.into()));

        let state_file = PathBuf::from(&cfg.persistence.data_dir).join(&cfg.persistence.state_file);
        let ledger = PositionLedger::new(cfg.into())
            .with_risk_gate(Arc::clone(&risk))
            .with_adaptive(Arc::clone(&adaptive))
            .with_state_file(state_file);
        ledger
            .load_state()
            .context("Failed to restore ledger state")?;

        let producers = builtin_producers(&cfg.bot.producers);
        if producers.is_empty() {
            warn!(requested = ?cfg.bot.producers, "No known producers registered");
        }
        let cascade = CascadeController::new(cfg.into(), Arc::clone(&adaptive)).with_producers(producers);

        Ok(Self::new(EngineParts {
            settings: cfg.into(),
            feed: Arc::new(JsonFileFeed::new(&cfg.engine.feed_path)),
            cascade,
            adaptive,
            selector: MultiSignalSelector::new(cfg.into()),
            risk,
            ledger: Arc::new(ledger),
            store: open_store(cfg),
            notifier: Arc::new(LogNotifier),
        }))
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn risk(&self) -> &Arc<RiskGate> {
        &self.risk
    }

    pub fn adaptive(&self) -> &Arc<AdaptiveThresholds> {
        &self.adaptive
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Replay stored history into the adaptive store. Returns trades replayed.
    pub async fn warm_start(&self) -> usize {
        match self.store.get_trade_history(WARM_START_TRADES).await {
            Ok(history) => {
                self.adaptive.warm_start(&history);
                info!(trades = history.len(), "[ENGINE] Adaptive thresholds warm-started");
                history.len()
            }
            Err(e) => {
                self.persistence_failed("get_trade_history", e);
                0
            }
        }
    }

    // ── Decision cycle ──────────────────────────────────────────

    /// Run one decision cycle unless one is already in flight.
    pub async fn run_cycle(&self) -> CycleReport {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            if let Ok(mut stats) = self.stats.write() {
                stats.cycles_skipped += 1;
            }
            debug!("[ENGINE] Previous cycle still running, skipping");
            return CycleReport {
                skipped: true,
                ..Default::default()
            };
        };

        let now = Utc::now();
        match self.decision_cycle(now).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "[ENGINE] Cycle aborted");
                if let Ok(mut stats) = self.stats.write() {
                    stats.cycles_aborted += 1;
                }
                self.drain_risk_warnings();
                CycleReport::default()
            }
        }
    }

    async fn decision_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, PipelineError> {
        if self.risk.roll_day(now) {
            info!("[ENGINE] New trading day, daily risk counters reset");
        }
        self.adaptive.check_emergency(now);

        let mut report = CycleReport::default();
        let batch = match self.feed.snapshot().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "[ENGINE] Feed unavailable, skipping cycle");
                return Ok(report);
            }
        };
        report.markets = batch.markets.len();
        if let Ok(mut events) = self.recent_events.write() {
            *events = batch.recent_events.clone();
        }

        let ctx = ScanContext {
            taken_at: now,
            recent_events: batch.recent_events,
        };
        let outcome = self.cascade.run_detailed(&batch.markets, &ctx).await;
        report.signals_found = outcome.signals.len();
        report.producer_errors = outcome.errors.len();
        for signal in &outcome.signals {
            dispatch(&self.notifier, AlertEvent::signal_found(signal));
        }

        let selected = self.selector.select(outcome.signals, &self.ledger.open_positions());
        report.selected = selected.len();

        for signal in &selected {
            // Re-read after every open so later candidates see earlier ones
            let open = self.ledger.open_positions();
            match self.risk.can_open_at(signal, &open, now) {
                Admission::Rejected(reason) => {
                    info!(
                        strategy = %signal.strategy_id,
                        market = %signal.market_id,
                        reason = %reason,
                        "[RISK] Signal rejected"
                    );
                    report.rejected.push((signal.market_id.clone(), reason.to_string()));
                }
                Admission::Admitted => {
                    let size = self.risk.size_for(signal);
                    match self.ledger.open(signal, size, now) {
                        Ok(position) => {
                            self.persist_open(&position).await;
                            dispatch(&self.notifier, AlertEvent::position_opened(&position));
                            report.opened.push(position);
                        }
                        Err(e) if e.aborts_cycle() => return Err(e),
                        Err(e) => {
                            warn!(market = %signal.market_id, error = %e, "[ENGINE] Open refused by ledger");
                            report.rejected.push((signal.market_id.clone(), e.to_string()));
                        }
                    }
                }
            }
        }

        self.drain_risk_warnings();

        if let Ok(mut stats) = self.stats.write() {
            stats.cycles_run += 1;
            stats.signals_found += report.signals_found as u64;
            stats.positions_opened += report.opened.len() as u64;
            stats.rejections += report.rejected.len() as u64;
            stats.last_cycle_at = Some(now);
        }
        if !report.opened.is_empty() || !report.rejected.is_empty() {
            info!(
                signals = report.signals_found,
                selected = report.selected,
                opened = report.opened.len(),
                rejected = report.rejected.len(),
                "[ENGINE] Cycle complete"
            );
        }
        Ok(report)
    }

    // ── Mark loop ───────────────────────────────────────────────

    /// Apply the latest prices, run producer exits and timeouts.
    pub async fn run_mark(&self) -> MarkReport {
        let now = Utc::now();
        match self.mark_pass(now).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "[ENGINE] Mark pass aborted");
                self.drain_risk_warnings();
                MarkReport::default()
            }
        }
    }

    async fn mark_pass(&self, now: DateTime<Utc>) -> Result<MarkReport, PipelineError> {
        let mut report = MarkReport::default();
        if self.ledger.open_position_count() == 0 {
            self.maybe_summary(now);
            return Ok(report);
        }

        let ticks = match self.feed.prices().await {
            Ok(ticks) => ticks,
            Err(e) => {
                warn!(error = %e, "[ENGINE] Price feed unavailable");
                Vec::new()
            }
        };
        report.ticks = ticks.len();

        for tick in &ticks {
            let held: Vec<String> = self
                .ledger
                .open_positions()
                .into_iter()
                .filter(|p| p.market_id == tick.market_id)
                .map(|p| p.id)
                .collect();
            if held.is_empty() {
                continue;
            }
            let outcome = self.ledger.mark(&tick.market_id, tick.price, tick.at)?;
            for child in outcome.opened {
                self.persist_open(&child).await;
                dispatch(&self.notifier, AlertEvent::position_opened(&child));
                report.opened.push(child);
            }
            self.settled(outcome.closed, &mut report).await;

            for id in held {
                if self.ledger.position(&id).is_some() {
                    if let Err(e) = self.store.update_position_price(&id, tick.price, tick.at).await {
                        self.persistence_failed("update_position_price", e);
                    }
                }
            }
        }

        // Producer exits; children follow their parent
        let ctx = ScanContext {
            taken_at: now,
            recent_events: self.recent_events.read().map(|e| e.clone()).unwrap_or_default(),
        };
        for position in self.ledger.open_positions() {
            if position.is_child() {
                continue;
            }
            let Some(producer) = self.cascade.producer(&position.strategy_id) else {
                continue;
            };
            let decision = producer.should_exit(&position, position.current_price, &ctx);
            if decision.exit {
                let closed = self
                    .ledger
                    .close(&position.id, ExitReason::SignalExit, &decision.reason, now)?;
                self.settled(closed, &mut report).await;
            }
        }

        let expired = self.ledger.check_timeouts(now)?;
        self.settled(expired, &mut report).await;

        self.drain_risk_warnings();
        self.maybe_summary(now);
        Ok(report)
    }

    /// Persist and announce settled trades, then refresh strategy stats.
    async fn settled(&self, closed: Vec<ClosedTrade>, report: &mut MarkReport) {
        if closed.is_empty() {
            return;
        }
        for trade in &closed {
            if let Err(e) = self.store.close_trade(trade).await {
                self.persistence_failed("close_trade", e);
            }
            dispatch(&self.notifier, AlertEvent::position_closed(trade));
        }

        let rows = self.adaptive.stats(Utc::now()).strategies;
        for row in rows
            .iter()
            .filter(|r| closed.iter().any(|t| t.strategy_id == r.strategy_id))
        {
            if let Err(e) = self.store.update_strategy_stats(row).await {
                self.persistence_failed("update_strategy_stats", e);
            }
        }

        if let Ok(mut stats) = self.stats.write() {
            stats.positions_closed += closed.len() as u64;
        }
        report.closed.extend(closed);
    }

    // ── Support ─────────────────────────────────────────────────

    async fn persist_open(&self, position: &Position) {
        if let Err(e) = self.store.save_trade(position).await {
            self.persistence_failed("save_trade", e);
        }
        if let Err(e) = self.store.save_position(position).await {
            self.persistence_failed("save_position", e);
        }
    }

    fn persistence_failed(&self, op: &str, e: anyhow::Error) {
        let err = PipelineError::PersistenceUnavailable(format!("{}: {:#}", op, e));
        warn!(error = %err, "[ENGINE] Continuing without durable record");
        if let Ok(mut stats) = self.stats.write() {
            stats.persistence_failures += 1;
        }
    }

    fn drain_risk_warnings(&self) {
        for warning in self.ledger.drain_risk_warnings() {
            dispatch(&self.notifier, AlertEvent::risk_warning(&warning));
        }
    }

    fn maybe_summary(&self, now: DateTime<Utc>) {
        let due = self
            .last_summary_at
            .read()
            .map(|last| now - *last >= self.settings.summary_interval)
            .unwrap_or(false);
        if !due {
            return;
        }
        if let Ok(mut last) = self.last_summary_at.write() {
            *last = now;
        }
        dispatch(&self.notifier, AlertEvent::Summary { text: self.summary_text(now) });
    }

    pub fn summary_text(&self, now: DateTime<Utc>) -> String {
        let adaptive = self.adaptive.stats(now);
        let cascade = self.cascade.stats();
        format!(
            "{}\n{}\n🔁 Cascade: {} scans, {} signals, {} loosened | emergency x{:.2}{}",
            self.ledger.summary_string(),
            self.risk.risk_report(now),
            cascade.total_scans,
            cascade.signals_found,
            cascade.retries_needed,
            adaptive.emergency_multiplier,
            if adaptive.emergency_mode { " (EMERGENCY)" } else { "" },
        )
    }

    // ── Loops ───────────────────────────────────────────────────

    /// Drive both loops until `shutdown` fires, then persist ledger state.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut scan = interval(self.settings.scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut mark = interval(self.settings.mark_interval);
        mark.set_missed_tick_behavior(MissedTickBehavior::Skip);

        dispatch(
            &self.notifier,
            AlertEvent::bot_status("STARTED", self.ledger.summary_string()),
        );
        info!(
            scan_secs = self.settings.scan_interval.as_secs(),
            mark_secs = self.settings.mark_interval.as_secs(),
            "[ENGINE] Loops running"
        );

        loop {
            tokio::select! {
                _ = scan.tick() => {
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        engine.run_cycle().await;
                    });
                }
                _ = mark.tick() => {
                    self.run_mark().await;
                }
                _ = shutdown.recv() => {
                    info!("[ENGINE] Shutdown requested");
                    break;
                }
            }
        }

        // Let an in-flight cycle finish before the final save
        let _guard = self.cycle_guard.lock().await;
        if let Err(e) = self.ledger.save_state() {
            error!(error = %e, "[ENGINE] Failed to save ledger state on shutdown");
        }
        dispatch(
            &self.notifier,
            AlertEvent::bot_status("STOPPED", self.ledger.summary_string()),
        );
    }
}

/// CSV store when enabled and writable, memory otherwise.
pub fn open_store(cfg: &AppConfig) -> Arc<dyn TradeStore> {
    if !cfg.persistence.csv_enabled {
        info!("[ENGINE] CSV persistence disabled, using in-memory store");
        return Arc::new(MemoryStore::new());
    }
    match CsvPersistence::new(&cfg.persistence.data_dir) {
        Ok(csv) => Arc::new(csv),
        Err(e) => {
            warn!(error = %e, "[ENGINE] CSV store unavailable, falling back to memory");
            Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedBatch;
    use crate::paper_trading::LedgerConfig;
    use crate::persistence::MockTradeStore;
    use crate::risk::RiskConfig;
    use crate::strategy::{AdaptiveConfig, CascadeConfig, MarketOnly, SelectorConfig};
    use crate::types::{MarketSnapshot, PriceTick};
    use anyhow::anyhow;
    use async_trait::async_trait;

    /// Feed whose batch the test swaps between calls
    struct StaticFeed {
        batch: RwLock<FeedBatch>,
    }

    impl StaticFeed {
        fn new(markets: Vec<MarketSnapshot>) -> Self {
            Self {
                batch: RwLock::new(FeedBatch {
                    updated_at: None,
                    markets,
                    recent_events: Vec::new(),
                }),
            }
        }

        fn set_price(&self, market_id: &str, price: f64) {
            let mut batch = self.batch.write().unwrap();
            for m in batch.markets.iter_mut().filter(|m| m.market_id == market_id) {
                m.current_price = price;
            }
        }
    }

    #[async_trait]
    impl MarketFeed for StaticFeed {
        async fn snapshot(&self) -> Result<FeedBatch> {
            Ok(self.batch.read().unwrap().clone())
        }

        async fn prices(&self) -> Result<Vec<PriceTick>> {
            Ok(self.batch.read().unwrap().ticks(Utc::now()))
        }
    }

    fn favourite(market_id: &str, price: f64) -> MarketSnapshot {
        MarketSnapshot {
            market_id: market_id.into(),
            event_id: Some(format!("evt-{}", market_id)),
            sport: "nba".into(),
            current_price: price,
            ..Default::default()
        }
    }

    fn engine_with(feed: Arc<StaticFeed>, store: Arc<dyn TradeStore>) -> Engine {
        let adaptive = Arc::new(AdaptiveThresholds::new(AdaptiveConfig::default()));
        let risk = Arc::new(RiskGate::new(RiskConfig::default()));
        let ledger = PositionLedger::new(LedgerConfig::default())
            .with_risk_gate(Arc::clone(&risk))
            .with_adaptive(Arc::clone(&adaptive));
        let cascade = CascadeController::new(CascadeConfig::default(), Arc::clone(&adaptive))
            .with_producer(Arc::new(MarketOnly::default()));
        Engine::new(EngineParts {
            settings: EngineSettings::default(),
            feed,
            cascade,
            adaptive,
            selector: MultiSignalSelector::new(SelectorConfig::default()),
            risk,
            ledger: Arc::new(ledger),
            store,
            notifier: Arc::new(LogNotifier),
        })
    }

    #[test]
    fn cycle_opens_admitted_signal_and_persists_it() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let feed = Arc::new(StaticFeed::new(vec![favourite("m1", 0.80)]));
            let store = Arc::new(MemoryStore::new());
            let engine = engine_with(Arc::clone(&feed), store.clone());

            let report = engine.run_cycle().await;
            assert!(!report.skipped);
            assert_eq!(report.signals_found, 1);
            assert_eq!(report.opened.len(), 1);
            assert_eq!(engine.ledger().open_position_count(), 1);
            assert_eq!(store.open_positions().len(), 1);
            assert_eq!(engine.stats().cycles_run, 1);
        });
    }

    #[test]
    fn persistence_failure_does_not_stop_the_cycle() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut store = MockTradeStore::new();
            store
                .expect_save_trade()
                .returning(|_| Err(anyhow!("disk full")));
            store
                .expect_save_position()
                .returning(|_| Err(anyhow!("disk full")));

            let feed = Arc::new(StaticFeed::new(vec![favourite("m1", 0.80)]));
            let engine = engine_with(feed, Arc::new(store));

            let report = engine.run_cycle().await;
            assert_eq!(report.opened.len(), 1);
            assert_eq!(engine.ledger().open_position_count(), 1);
            assert_eq!(engine.stats().persistence_failures, 2);
        });
    }

    #[test]
    fn overlapping_cycle_is_skipped() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let feed = Arc::new(StaticFeed::new(vec![favourite("m1", 0.80)]));
            let engine = engine_with(feed, Arc::new(MemoryStore::new()));

            let _held = engine.cycle_guard.try_lock().unwrap();
            let report = engine.run_cycle().await;
            assert!(report.skipped);
            assert_eq!(engine.stats().cycles_skipped, 1);
            assert_eq!(engine.ledger().open_position_count(), 0);
        });
    }

    #[test]
    fn mark_closes_on_take_profit_and_feeds_back() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let feed = Arc::new(StaticFeed::new(vec![favourite("m1", 0.80)]));
            let store = Arc::new(MemoryStore::new());
            let engine = engine_with(Arc::clone(&feed), store.clone());
            engine.run_cycle().await;
            let balance_after_open = engine.ledger().balance();

            // Favourite collapses: the NO side is deep in profit
            feed.set_price("m1", 0.50);
            let report = engine.run_mark().await;

            assert_eq!(report.closed.len(), 1);
            assert_eq!(report.closed[0].exit_reason, ExitReason::TakeProfit);
            assert!(report.closed[0].pnl > 0.0);
            assert_eq!(engine.ledger().open_position_count(), 0);
            assert!(engine.ledger().balance() > balance_after_open);

            let history = store.get_trade_history(10).await.unwrap();
            assert_eq!(history.len(), 1);
            assert!(store.strategy_stats("market_only").is_some());
            assert!(engine.risk().status(Utc::now()).daily_pnl > 0.0);
            assert_eq!(
                engine.adaptive().performance("market_only").map(|p| p.total_trades),
                Some(1)
            );
        });
    }

    #[test]
    fn feed_failure_yields_empty_cycle() {
        struct DownFeed;

        #[async_trait]
        impl MarketFeed for DownFeed {
            async fn snapshot(&self) -> Result<FeedBatch> {
                Err(anyhow!("connection refused"))
            }

            async fn prices(&self) -> Result<Vec<PriceTick>> {
                Err(anyhow!("connection refused"))
            }
        }

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let adaptive = Arc::new(AdaptiveThresholds::new(AdaptiveConfig::default()));
            let risk = Arc::new(RiskGate::default());
            let engine = Engine::new(EngineParts {
                settings: EngineSettings::default(),
                feed: Arc::new(DownFeed),
                cascade: CascadeController::new(CascadeConfig::default(), Arc::clone(&adaptive)),
                adaptive,
                selector: MultiSignalSelector::new(SelectorConfig::default()),
                risk,
                ledger: Arc::new(PositionLedger::new(LedgerConfig::default())),
                store: Arc::new(MemoryStore::new()),
                notifier: Arc::new(LogNotifier),
            });
            let report = engine.run_cycle().await;
            assert_eq!(report.markets, 0);
            assert!(report.opened.is_empty());
        });
    }
}
