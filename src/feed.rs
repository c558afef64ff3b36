//! Market/context feed
//!
//! The pipeline only needs a snapshot per decision cycle and a batch of
//! prices per mark tick. `JsonFileFeed` reads both from a JSON file that an
//! external collector keeps up to date.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::types::{MarketSnapshot, PriceTick};

/// One read of the feed: markets plus scan context inputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedBatch {
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<MarketSnapshot>,
    /// Recent game events (goals, wickets, injuries)
    #[serde(default)]
    pub recent_events: Vec<String>,
}

impl FeedBatch {
    /// Price ticks stamped with the batch time, or `now` when unstamped.
    pub fn ticks(&self, now: DateTime<Utc>) -> Vec<PriceTick> {
        let at = self.updated_at.unwrap_or(now);
        self.markets
            .iter()
            .filter(|m| m.current_price.is_finite() && m.current_price > 0.0)
            .map(|m| PriceTick {
                market_id: m.market_id.clone(),
                price: m.current_price,
                at,
            })
            .collect()
    }
}

#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self) -> Result<FeedBatch>;

    async fn prices(&self) -> Result<Vec<PriceTick>>;
}

/// Re-reads a JSON file on every call
pub struct JsonFileFeed {
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<FeedBatch> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!(path = %self.path.display(), "Feed file missing, empty snapshot");
            return Ok(FeedBatch::default());
        }
        let json = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading feed {}", self.path.display()))?;
        let batch: FeedBatch = serde_json::from_str(&json)
            .with_context(|| format!("parsing feed {}", self.path.display()))?;
        Ok(batch)
    }
}

#[async_trait]
impl MarketFeed for JsonFileFeed {
    async fn snapshot(&self) -> Result<FeedBatch> {
        self.read().await
    }

    async fn prices(&self) -> Result<Vec<PriceTick>> {
        Ok(self.read().await?.ticks(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_feed(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cascadebot_feed_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn sparse_markets_default_safely() {
        let path = temp_feed(
            "sparse",
            r#"{"markets":[{"market_id":"m1","current_price":0.61}],"recent_events":["goal"]}"#,
        );
        let feed = JsonFileFeed::new(&path);
        let batch = tokio_test::block_on(feed.snapshot()).unwrap();
        assert_eq!(batch.markets.len(), 1);
        assert_eq!(batch.markets[0].previous_price, None);
        assert_eq!(batch.markets[0].spread, None);
        assert_eq!(batch.recent_events, vec!["goal".to_string()]);

        let ticks = tokio_test::block_on(feed.prices()).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, 0.61);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_is_an_empty_snapshot() {
        let feed = JsonFileFeed::new(std::env::temp_dir().join("cascadebot_no_such_feed.json"));
        let batch = tokio_test::block_on(feed.snapshot()).unwrap();
        assert!(batch.markets.is_empty());
    }

    #[test]
    fn ticks_use_batch_timestamp_and_skip_unpriced() {
        let stamp = Utc::now() - chrono::Duration::minutes(3);
        let batch = FeedBatch {
            updated_at: Some(stamp),
            markets: vec![
                MarketSnapshot {
                    market_id: "a".into(),
                    current_price: 0.4,
                    ..Default::default()
                },
                MarketSnapshot {
                    market_id: "b".into(),
                    current_price: 0.0,
                    ..Default::default()
                },
            ],
            recent_events: Vec::new(),
        };
        let ticks = batch.ticks(Utc::now());
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].at, stamp);
    }
}
