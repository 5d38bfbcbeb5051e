// =============================================================================
// StreamForge - multi-exchange candle ingestion
// =============================================================================

pub mod api;
pub mod backfill;
pub mod error;
pub mod exchanges;
pub mod market_data;
pub mod monitor;
pub mod pipeline;
pub mod rest;
pub mod runner;
pub mod runtime_config;
pub mod sink;
pub mod types;
pub mod warmup;
