// =============================================================================
// Timeframe Aggregator - synthesizes higher timeframes from closed base candles
// =============================================================================
//
// Each (symbol, target) pair owns one accumulator. A closed base candle is
// folded into the target window that contains its open time. The aggregate is
// emitted as soon as the base candle that ends the window is folded, or when a
// later base candle rolls into the next window (a gap in the base feed).
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::market_data::candle::Candle;
use crate::types::Timeframe;

/// Running OHLCV for one (symbol, target) window.
#[derive(Debug, Clone)]
struct AggregationAccumulator {
    candle: Candle,
    constituents: i64,
}

#[derive(Debug)]
pub struct TimeframeAggregator {
    base: Timeframe,
    targets: Vec<Timeframe>,
    accumulators: HashMap<(String, Timeframe), AggregationAccumulator>,
    /// Open time of the last base candle folded per (symbol, target).
    last_folded: HashMap<(String, Timeframe), i64>,
    partial_emitted: u64,
}

impl TimeframeAggregator {
    /// Every target must be a strict multiple of `base`.
    pub fn new(base: Timeframe, targets: &[Timeframe]) -> Result<Self, ConfigError> {
        for target in targets {
            if !target.is_aggregate_of(base) {
                return Err(ConfigError::InvalidAggregate {
                    base: base.to_string(),
                    target: target.to_string(),
                });
            }
        }
        let mut targets = targets.to_vec();
        targets.sort();
        targets.dedup();

        Ok(Self {
            base,
            targets,
            accumulators: HashMap::new(),
            last_folded: HashMap::new(),
            partial_emitted: 0,
        })
    }

    pub fn base(&self) -> Timeframe {
        self.base
    }

    pub fn targets(&self) -> &[Timeframe] {
        &self.targets
    }

    /// Base candles needed to fill one window of the largest target.
    pub fn warmup_horizon(&self) -> usize {
        self.targets
            .iter()
            .filter_map(|t| t.ratio_to(self.base))
            .max()
            .unwrap_or(0) as usize
    }

    /// Fold warmup candles for `symbol`. Aggregates completed while seeding are
    /// returned; emitting them is the caller's choice.
    pub fn seed(&mut self, symbol: &str, warmup: &[Candle]) -> Vec<Candle> {
        let mut completed = Vec::new();
        for candle in warmup.iter().filter(|c| c.symbol == symbol) {
            completed.extend(self.fold(candle, true));
        }
        debug!(
            symbol,
            seeded = warmup.len(),
            completed = completed.len(),
            "aggregator seeded from warmup"
        );
        completed
    }

    /// Fold one closed base candle. In-progress candles are ignored.
    pub fn push(&mut self, base: &Candle) -> Vec<Candle> {
        if !base.is_closed {
            return Vec::new();
        }
        self.fold(base, false)
    }

    /// Number of aggregates emitted with fewer constituents than a full window.
    pub fn partial_emitted(&self) -> u64 {
        self.partial_emitted
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn fold(&mut self, base: &Candle, seeding: bool) -> Vec<Candle> {
        let mut out = Vec::new();
        if base.timeframe != self.base || !base.is_closed {
            debug!(key = %base.key(), "non-base or open candle skipped by aggregator");
            return out;
        }

        for target in self.targets.clone() {
            let key = (base.symbol.clone(), target);

            if self
                .last_folded
                .get(&key)
                .is_some_and(|last| base.open_time <= *last)
            {
                debug!(
                    symbol = %base.symbol,
                    target = %target,
                    open_time = base.open_time,
                    "base candle already folded; dropped"
                );
                continue;
            }

            let window = target.window_start(base.open_time);
            let window_end = window + target.duration_ms();

            if let Some(acc) = self.accumulators.remove(&key) {
                if acc.candle.open_time == window {
                    self.accumulators.insert(key.clone(), acc);
                } else {
                    out.push(self.close(acc, target, seeding));
                }
            }

            match self.accumulators.get_mut(&key) {
                Some(acc) => {
                    let c = &mut acc.candle;
                    c.high = c.high.max(base.high);
                    c.low = c.low.min(base.low);
                    c.close = base.close;
                    c.volume += base.volume;
                    c.quote_volume = match (c.quote_volume, base.quote_volume) {
                        (Some(a), Some(b)) => Some(a + b),
                        (a, b) => a.or(b),
                    };
                    c.trade_count += base.trade_count;
                    acc.constituents += 1;
                }
                None => {
                    let candle = Candle {
                        timeframe: target,
                        open_time: window,
                        close_time: window_end,
                        is_closed: false,
                        ..base.clone()
                    };
                    self.accumulators.insert(
                        key.clone(),
                        AggregationAccumulator {
                            candle,
                            constituents: 1,
                        },
                    );
                }
            }
            self.last_folded.insert(key.clone(), base.open_time);

            if base.close_time >= window_end {
                if let Some(acc) = self.accumulators.remove(&key) {
                    out.push(self.close(acc, target, seeding));
                }
            }
        }
        out.sort_by_key(|c| (c.close_time, c.timeframe));
        out
    }

    fn close(&mut self, acc: AggregationAccumulator, target: Timeframe, seeding: bool) -> Candle {
        let expected = target.ratio_to(self.base).unwrap_or(1);
        let mut candle = acc.candle;
        candle.is_closed = true;

        if acc.constituents < expected {
            self.partial_emitted += 1;
            if seeding {
                debug!(
                    key = %candle.key(),
                    constituents = acc.constituents,
                    expected,
                    "partial aggregate completed during warmup"
                );
            } else {
                warn!(
                    key = %candle.key(),
                    open_time = candle.open_time,
                    constituents = acc.constituents,
                    expected,
                    "emitting partial aggregate"
                );
            }
        }
        candle
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
