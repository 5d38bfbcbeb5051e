pub mod aggregator;
pub mod alias;
pub mod assembler;
pub mod candle;
pub mod merger;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use aggregator::TimeframeAggregator;
pub use alias::{AliasResolver, RawFields};
pub use assembler::{AssemblerSet, CandleAssembler};
pub use candle::{Candle, CandleKey};
pub use merger::merge;
