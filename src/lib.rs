//! CascadeBot Library
//!
//! Decision and execution pipeline for prediction-market paper trading:
//! cascade signal gathering, adaptive thresholds, diversified selection,
//! risk gating and a position ledger with exit management.

pub mod alerts;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod paper_trading;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod types;
