//! CSV Persistence Module
//!
//! Trade, position and strategy-stat storage behind the `TradeStore` trait.
//! The pipeline treats the store as a pure sink/source: every failure is
//! logged by the caller and the bot keeps running in memory.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info};

use crate::paper_trading::Position;
use crate::strategy::adaptive::StrategyStatsRow;
use crate::types::{ClosedTrade, Direction, ExitReason, TradeResult};

// ─────────────────────────────────────────────────────────────────
// Store interface
// ─────────────────────────────────────────────────────────────────

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Record a newly opened position
    async fn save_trade(&self, position: &Position) -> Result<()>;

    /// Record a settled position
    async fn close_trade(&self, trade: &ClosedTrade) -> Result<()>;

    /// Full snapshot of an open position
    async fn save_position(&self, position: &Position) -> Result<()>;

    async fn update_position_price(
        &self,
        position_id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_strategy_stats(&self, stats: &StrategyStatsRow) -> Result<()>;

    /// Most recent `limit` closed trades, oldest first
    async fn get_trade_history(&self, limit: usize) -> Result<Vec<ClosedTrade>>;

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<DailyStats>;
}

// ─────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────

/// Trade record for CSV storage. One OPEN row per entry, one CLOSE row per exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub event: String,
    pub trade_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub pyramid_level: u32,
    pub strategy_id: String,
    pub market_id: String,
    pub correlation_key: String,
    pub direction: String,
    pub confidence: f64,
    pub size: f64,
    pub entry_price: f64,
    pub opened_at: i64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub pnl_pct: Option<f64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub exit_reason: Option<String>,
    #[serde(default)]
    pub exit_detail: Option<String>,
    #[serde(default)]
    pub hold_secs: Option<i64>,
    #[serde(default)]
    pub balance_after: Option<f64>,
}

const EVENT_OPEN: &str = "OPEN";
const EVENT_CLOSE: &str = "CLOSE";

impl TradeRecord {
    pub fn opened(position: &Position) -> Self {
        Self {
            timestamp: position.opened_at.timestamp_millis(),
            event: EVENT_OPEN.to_string(),
            trade_id: position.id.clone(),
            parent_id: position.parent_id.clone(),
            pyramid_level: position.pyramid_level,
            strategy_id: position.strategy_id.clone(),
            market_id: position.market_id.clone(),
            correlation_key: position.correlation_key.clone(),
            direction: position.direction.to_string(),
            confidence: position.confidence,
            size: position.size,
            entry_price: position.entry_price,
            opened_at: position.opened_at.timestamp_millis(),
            exit_price: None,
            pnl: None,
            pnl_pct: None,
            result: None,
            exit_reason: None,
            exit_detail: None,
            hold_secs: None,
            balance_after: None,
        }
    }

    pub fn closed(trade: &ClosedTrade) -> Self {
        Self {
            timestamp: trade.closed_at.timestamp_millis(),
            event: EVENT_CLOSE.to_string(),
            trade_id: trade.id.clone(),
            parent_id: trade.parent_id.clone(),
            pyramid_level: trade.pyramid_level,
            strategy_id: trade.strategy_id.clone(),
            market_id: trade.market_id.clone(),
            correlation_key: trade.correlation_key.clone(),
            direction: trade.direction.to_string(),
            confidence: trade.confidence,
            size: trade.size,
            entry_price: trade.entry_price,
            opened_at: trade.opened_at.timestamp_millis(),
            exit_price: Some(trade.exit_price),
            pnl: Some(trade.pnl),
            pnl_pct: Some(trade.pnl_pct),
            result: Some(trade.result().to_string()),
            exit_reason: Some(trade.exit_reason.to_string()),
            exit_detail: Some(trade.exit_detail.clone()),
            hold_secs: Some(trade.hold_secs()),
            balance_after: trade.balance_after.is_finite().then_some(trade.balance_after),
        }
    }

    /// Rebuild the closed trade from a CLOSE row.
    pub fn to_closed_trade(&self) -> Result<ClosedTrade> {
        if self.event != EVENT_CLOSE {
            return Err(anyhow!("row {} is not a CLOSE event", self.trade_id));
        }
        let exit_reason = self
            .exit_reason
            .as_deref()
            .ok_or_else(|| anyhow!("row {} has no exit reason", self.trade_id))?;
        Ok(ClosedTrade {
            id: self.trade_id.clone(),
            parent_id: self.parent_id.clone(),
            pyramid_level: self.pyramid_level,
            strategy_id: self.strategy_id.clone(),
            market_id: self.market_id.clone(),
            correlation_key: self.correlation_key.clone(),
            direction: parse_direction_label(&self.direction)?,
            confidence: self.confidence,
            size: self.size,
            entry_price: self.entry_price,
            exit_price: self.exit_price.unwrap_or(self.entry_price),
            pnl: self.pnl.unwrap_or(0.0),
            pnl_pct: self.pnl_pct.unwrap_or(0.0),
            opened_at: millis_to_utc(self.opened_at)?,
            closed_at: millis_to_utc(self.timestamp)?,
            exit_reason: parse_exit_reason(exit_reason)?,
            exit_detail: self.exit_detail.clone().unwrap_or_default(),
            balance_after: self.balance_after.unwrap_or(f64::NAN),
        })
    }
}

/// Position snapshot or price update row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub timestamp: i64,
    pub event: String,
    pub position_id: String,
    pub price: f64,
    #[serde(default)]
    pub market_id: Option<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub unrealized_pnl: Option<f64>,
    #[serde(default)]
    pub high_water_mark: Option<f64>,
    #[serde(default)]
    pub trailing_armed: Option<bool>,
    #[serde(default)]
    pub pyramid_level: Option<u32>,
}

impl PositionRecord {
    fn snapshot(position: &Position) -> Self {
        Self {
            timestamp: position
                .last_tick_at
                .unwrap_or(position.opened_at)
                .timestamp_millis(),
            event: "SNAPSHOT".to_string(),
            position_id: position.id.clone(),
            price: position.current_price,
            market_id: Some(position.market_id.clone()),
            strategy_id: Some(position.strategy_id.clone()),
            direction: Some(position.direction.to_string()),
            entry_price: Some(position.entry_price),
            size: Some(position.size),
            unrealized_pnl: Some(position.unrealized_pnl),
            high_water_mark: Some(position.high_water_mark),
            trailing_armed: Some(position.trailing_armed),
            pyramid_level: Some(position.pyramid_level),
        }
    }

    fn price_update(position_id: &str, price: f64, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.timestamp_millis(),
            event: "PRICE".to_string(),
            position_id: position_id.to_string(),
            price,
            market_id: None,
            strategy_id: None,
            direction: None,
            entry_price: None,
            size: None,
            unrealized_pnl: None,
            high_water_mark: None,
            trailing_armed: None,
            pyramid_level: None,
        }
    }
}

/// Per-strategy adaptive stats row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStatsRecord {
    pub timestamp: i64,
    pub strategy_id: String,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub threshold_multiplier: f64,
}

impl From<&StrategyStatsRow> for StrategyStatsRecord {
    fn from(row: &StrategyStatsRow) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            strategy_id: row.strategy_id.clone(),
            total_trades: row.trades,
            wins: row.wins,
            losses: row.losses,
            win_rate: row.win_rate,
            avg_pnl: row.avg_pnl,
            threshold_multiplier: row.multiplier,
        }
    }
}

/// Aggregate of one UTC day's closed trades
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: String,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub win_rate: f64,
}

impl DailyStats {
    pub fn from_trades(date: NaiveDate, trades: &[ClosedTrade]) -> Self {
        let mut stats = DailyStats {
            date: date.format("%Y-%m-%d").to_string(),
            ..Default::default()
        };
        for trade in trades {
            stats.trades += 1;
            stats.total_pnl += trade.pnl;
            match trade.result() {
                TradeResult::Win => stats.wins += 1,
                TradeResult::Loss => stats.losses += 1,
            }
        }
        if stats.trades > 0 {
            stats.win_rate = stats.wins as f64 / stats.trades as f64;
        }
        stats
    }
}

fn parse_direction_label(s: &str) -> Result<Direction> {
    match s.trim().to_ascii_uppercase().as_str() {
        "BUY_YES" => Ok(Direction::BuyYes),
        "BUY_NO" => Ok(Direction::BuyNo),
        other => Err(anyhow!("unknown direction label: {}", other)),
    }
}

fn parse_exit_reason(s: &str) -> Result<ExitReason> {
    match s.trim().to_ascii_uppercase().as_str() {
        "TAKE_PROFIT" => Ok(ExitReason::TakeProfit),
        "STOP_LOSS" => Ok(ExitReason::StopLoss),
        "TRAILING_STOP" => Ok(ExitReason::TrailingStop),
        "TIMEOUT" => Ok(ExitReason::Timeout),
        "SIGNAL_EXIT" => Ok(ExitReason::SignalExit),
        "PARENT_CLOSED" => Ok(ExitReason::ParentClosed),
        "MANUAL" => Ok(ExitReason::Manual),
        other => Err(anyhow!("unknown exit reason: {}", other)),
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("invalid timestamp {}", ms))
}

// ─────────────────────────────────────────────────────────────────
// CSV store
// ─────────────────────────────────────────────────────────────────

/// Writer bound to one day's file; reopened when the UTC date changes
struct DailyWriter {
    dir: PathBuf,
    prefix: &'static str,
    date: String,
    writer: csv::Writer<std::fs::File>,
}

impl DailyWriter {
    fn open(dir: PathBuf, prefix: &'static str) -> Result<Self> {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let writer = CsvPersistence::create_writer(&dir, &format!("{}_{}.csv", prefix, date))?;
        Ok(Self {
            dir,
            prefix,
            date,
            writer,
        })
    }

    fn current(&mut self) -> Result<&mut csv::Writer<std::fs::File>> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if today != self.date {
            self.writer.flush().context("Failed to flush rotated writer")?;
            self.writer = CsvPersistence::create_writer(
                &self.dir,
                &format!("{}_{}.csv", self.prefix, today),
            )?;
            debug!(prefix = self.prefix, date = %today, "Rotated CSV file");
            self.date = today;
        }
        Ok(&mut self.writer)
    }

    fn append<T: Serialize>(&mut self, record: &T, what: &str) -> Result<()> {
        let writer = self.current()?;
        writer
            .serialize(record)
            .with_context(|| format!("Failed to write {} record", what))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {} writer", what))?;
        Ok(())
    }
}

/// CSV persistence manager
pub struct CsvPersistence {
    data_dir: PathBuf,
    trade_writer: Arc<AsyncRwLock<DailyWriter>>,
    position_writer: Arc<AsyncRwLock<DailyWriter>>,
    strategy_stats_writer: Arc<AsyncRwLock<DailyWriter>>,
}

impl CsvPersistence {
    /// Create a new CSV persistence manager
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);

        // Create directory if it doesn't exist
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Create subdirectories
        for sub in ["trades", "positions", "strategy_stats"] {
            fs::create_dir_all(data_dir.join(sub))
                .with_context(|| format!("Failed to create {} directory", sub))?;
        }

        let trade_writer = DailyWriter::open(data_dir.join("trades"), "trades")?;
        let position_writer = DailyWriter::open(data_dir.join("positions"), "positions")?;
        let strategy_stats_writer =
            DailyWriter::open(data_dir.join("strategy_stats"), "strategy_stats")?;

        info!(path = %data_dir.display(), "CSV persistence ready");
        Ok(Self {
            data_dir,
            trade_writer: Arc::new(AsyncRwLock::new(trade_writer)),
            position_writer: Arc::new(AsyncRwLock::new(position_writer)),
            strategy_stats_writer: Arc::new(AsyncRwLock::new(strategy_stats_writer)),
        })
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    fn read_trade_file(path: &Path) -> Result<Vec<TradeRecord>> {
        let file = std::fs::File::open(path).context("Failed to open trade file")?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: TradeRecord = result.context("Failed to deserialize trade record")?;
            records.push(record);
        }
        Ok(records)
    }

    /// Trade files sorted by date, oldest first
    fn trade_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.data_dir.join("trades");
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("trades_") && n.ends_with(".csv"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn closed_trades_in(path: &Path) -> Result<Vec<ClosedTrade>> {
        Self::read_trade_file(path)?
            .iter()
            .filter(|r| r.event == EVENT_CLOSE)
            .map(TradeRecord::to_closed_trade)
            .collect()
    }
}

#[async_trait]
impl TradeStore for CsvPersistence {
    async fn save_trade(&self, position: &Position) -> Result<()> {
        let mut writer = self.trade_writer.write().await;
        writer.append(&TradeRecord::opened(position), "trade")
    }

    async fn close_trade(&self, trade: &ClosedTrade) -> Result<()> {
        let mut writer = self.trade_writer.write().await;
        writer.append(&TradeRecord::closed(trade), "trade")
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        let mut writer = self.position_writer.write().await;
        writer.append(&PositionRecord::snapshot(position), "position")
    }

    async fn update_position_price(
        &self,
        position_id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut writer = self.position_writer.write().await;
        writer.append(&PositionRecord::price_update(position_id, price, at), "position")
    }

    async fn update_strategy_stats(&self, stats: &StrategyStatsRow) -> Result<()> {
        let mut writer = self.strategy_stats_writer.write().await;
        writer.append(&StrategyStatsRecord::from(stats), "strategy stats")
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<ClosedTrade>> {
        let mut trades = Vec::new();
        // Newest files first until the limit is covered
        for path in self.trade_files()?.iter().rev() {
            let mut day = Self::closed_trades_in(path)?;
            day.append(&mut trades);
            trades = day;
            if trades.len() >= limit {
                break;
            }
        }
        trades.sort_by_key(|t| t.closed_at);
        let skip = trades.len().saturating_sub(limit);
        Ok(trades.into_iter().skip(skip).collect())
    }

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<DailyStats> {
        let path = self
            .data_dir
            .join("trades")
            .join(format!("trades_{}.csv", date.format("%Y-%m-%d")));
        let trades = if path.exists() {
            Self::closed_trades_in(&path)?
        } else {
            Vec::new()
        };
        Ok(DailyStats::from_trades(date, &trades))
    }
}

// ─────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────

/// In-memory store; the fallback when no CSV directory is usable
#[derive(Default)]
pub struct MemoryStore {
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<ClosedTrade>>,
    strategy_stats: RwLock<HashMap<String, StrategyStatsRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open
            .read()
            .map(|o| o.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn strategy_stats(&self, strategy_id: &str) -> Option<StrategyStatsRow> {
        self.strategy_stats.read().ok()?.get(strategy_id).cloned()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("memory store lock poisoned")
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save_trade(&self, position: &Position) -> Result<()> {
        self.open
            .write()
            .map_err(poisoned)?
            .insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn close_trade(&self, trade: &ClosedTrade) -> Result<()> {
        self.open.write().map_err(poisoned)?.remove(&trade.id);
        self.closed.write().map_err(poisoned)?.push(trade.clone());
        Ok(())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        self.open
            .write()
            .map_err(poisoned)?
            .insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn update_position_price(
        &self,
        position_id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(pos) = self.open.write().map_err(poisoned)?.get_mut(position_id) {
            pos.current_price = price;
            pos.last_tick_at = Some(at);
        }
        Ok(())
    }

    async fn update_strategy_stats(&self, stats: &StrategyStatsRow) -> Result<()> {
        self.strategy_stats
            .write()
            .map_err(poisoned)?
            .insert(stats.strategy_id.clone(), stats.clone());
        Ok(())
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<ClosedTrade>> {
        let closed = self.closed.read().map_err(poisoned)?;
        let skip = closed.len().saturating_sub(limit);
        Ok(closed.iter().skip(skip).cloned().collect())
    }

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<DailyStats> {
        let closed = self.closed.read().map_err(poisoned)?;
        let day: Vec<ClosedTrade> = closed
            .iter()
            .filter(|t| t.closed_at.date_naive() == date)
            .cloned()
            .collect();
        Ok(DailyStats::from_trades(date, &day))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketSnapshot, Signal};

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "cascadebot_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn make_position() -> Position {
        let market = MarketSnapshot {
            market_id: "mkt-1".into(),
            event_id: Some("ev-1".into()),
            sport: "nfl".into(),
            current_price: 0.42,
            ..Default::default()
        };
        let signal = Signal::new(
            "market_only",
            &market,
            Direction::BuyYes,
            0.42,
            0.55,
            0.35,
            0.7,
            20.0,
            "test",
        );
        Position::from_signal(&signal, 0.42, 20.0, Utc::now())
    }

    fn close(position: &Position, pnl: f64, reason: ExitReason) -> ClosedTrade {
        ClosedTrade {
            id: position.id.clone(),
            parent_id: None,
            pyramid_level: 0,
            strategy_id: position.strategy_id.clone(),
            market_id: position.market_id.clone(),
            correlation_key: position.correlation_key.clone(),
            direction: position.direction,
            confidence: position.confidence,
            size: position.size,
            entry_price: position.entry_price,
            exit_price: 0.5,
            pnl,
            pnl_pct: pnl / position.size * 100.0,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
            exit_reason: reason,
            exit_detail: "detail, with comma".into(),
            balance_after: 1003.5,
        }
    }

    #[test]
    fn csv_store_round_trips_closed_trades() {
        let data_dir = temp_data_dir("round_trip");
        let store = CsvPersistence::new(data_dir.to_str().unwrap()).unwrap();
        let position = make_position();
        let rt = tokio::runtime::Runtime::new().unwrap();

        let history = rt.block_on(async {
            store.save_trade(&position).await.unwrap();
            store
                .update_position_price(&position.id, 0.45, Utc::now())
                .await
                .unwrap();
            store
                .close_trade(&close(&position, 3.5, ExitReason::TakeProfit))
                .await
                .unwrap();
            store.get_trade_history(10).await.unwrap()
        });

        assert_eq!(history.len(), 1, "OPEN rows are not closed trades");
        let trade = &history[0];
        assert_eq!(trade.id, position.id);
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.direction, Direction::BuyYes);
        assert_eq!(trade.exit_detail, "detail, with comma");
        assert!((trade.pnl - 3.5).abs() < 1e-9);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[test]
    fn csv_daily_stats_counts_todays_closes() {
        let data_dir = temp_data_dir("daily_stats");
        let store = CsvPersistence::new(data_dir.to_str().unwrap()).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();

        let stats = rt.block_on(async {
            for pnl in [2.0, -1.0, 4.0] {
                let position = make_position();
                store.save_trade(&position).await.unwrap();
                store
                    .close_trade(&close(&position, pnl, ExitReason::StopLoss))
                    .await
                    .unwrap();
            }
            store.get_daily_stats(Utc::now().date_naive()).await.unwrap()
        });

        assert_eq!(stats.trades, 3);
        assert_eq!(stats.wins, 2);
        assert!((stats.total_pnl - 5.0).abs() < 1e-9);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[test]
    fn create_writer_adds_headers_when_file_exists_but_is_empty() {
        let data_dir = temp_data_dir("headers_on_empty");
        let trades_dir = data_dir.join("trades");
        fs::create_dir_all(&trades_dir).unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let trade_file = trades_dir.join(format!("trades_{}.csv", today));
        fs::write(&trade_file, "").unwrap();

        let store = CsvPersistence::new(data_dir.to_str().unwrap()).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async { store.save_trade(&make_position()).await.unwrap() });

        let content = fs::read_to_string(&trade_file).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap_or_default();
        assert!(
            header.starts_with("timestamp,event,trade_id,parent_id,pyramid_level,strategy_id"),
            "unexpected header line: {}",
            header
        );
        assert!(lines.next().is_some(), "expected one data row after header");

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[test]
    fn memory_store_keeps_history_limit_and_open_set() {
        let store = MemoryStore::new();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let positions: Vec<Position> = (0..3).map(|_| make_position()).collect();

        let history = rt.block_on(async {
            for pos in &positions {
                store.save_trade(pos).await.unwrap();
            }
            for pos in &positions[..2] {
                store.close_trade(&close(pos, 1.0, ExitReason::Manual)).await.unwrap();
            }
            store.get_trade_history(1).await.unwrap()
        });

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, positions[1].id);
        assert_eq!(store.open_positions().len(), 1);
    }

    #[test]
    fn unknown_labels_are_rejected() {
        assert!(parse_direction_label("SIDEWAYS").is_err());
        assert!(parse_exit_reason("LIQUIDATED").is_err());
        assert_eq!(parse_exit_reason("trailing_stop").unwrap(), ExitReason::TrailingStop);
    }
}
