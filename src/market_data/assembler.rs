// =============================================================================
// Candle Assembler - folds partial updates into one candle per window
// =============================================================================
//
// One assembler owns one (source, symbol, timeframe) series. Updates are keyed
// by `timeframe.window_start(open_time)`; a window is finalized when a newer
// window arrives, when the exchange flags it closed, or when `flush_expired`
// decides the feed went quiet past the boundary. Once finalized a window is
// never reopened.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::market_data::candle::{Candle, CandleKey};
use crate::types::{Timeframe, VolumeMode};

/// Assembles candles for a single series.
#[derive(Debug, Clone)]
pub struct CandleAssembler {
    timeframe: Timeframe,
    volume_mode: VolumeMode,
    open: Option<Candle>,
    /// Window start of the most recently finalized candle.
    last_finalized: Option<i64>,
    dropped: u64,
}

impl CandleAssembler {
    pub fn new(timeframe: Timeframe, volume_mode: VolumeMode) -> Self {
        Self {
            timeframe,
            volume_mode,
            open: None,
            last_finalized: None,
            dropped: 0,
        }
    }

    /// Apply one resolved update. Returns the candles finalized by it, oldest
    /// first (at most two: the rolled-over window and an update that arrived
    /// already closed).
    pub fn update(&mut self, update: Candle) -> Vec<Candle> {
        let window = self.timeframe.window_start(update.open_time);
        let mut finalized = Vec::new();

        if self.last_finalized.is_some_and(|last| window <= last) {
            self.dropped += 1;
            debug!(
                key = %update.key(),
                window,
                "update for an already finalized window dropped"
            );
            return finalized;
        }

        match self.open.take() {
            None => self.open = Some(self.seed(window, update)),
            Some(mut current) if current.open_time == window => {
                self.merge(&mut current, &update);
                self.open = Some(current);
            }
            Some(current) if window > current.open_time => {
                finalized.push(self.finalize(current));
                self.open = Some(self.seed(window, update));
            }
            Some(current) => {
                self.dropped += 1;
                warn!(
                    key = %update.key(),
                    window,
                    open_window = current.open_time,
                    "out-of-order update older than the open window dropped"
                );
                self.open = Some(current);
                return finalized;
            }
        }

        if self.open.as_ref().is_some_and(|c| c.is_closed) {
            if let Some(current) = self.open.take() {
                finalized.push(self.finalize(current));
            }
        }
        finalized
    }

    /// Finalize the open window if its end plus `grace_ms` has passed.
    pub fn flush_expired(&mut self, now_ms: i64, grace_ms: i64) -> Option<Candle> {
        let expired = self
            .open
            .as_ref()
            .is_some_and(|c| c.close_time + grace_ms <= now_ms);
        if !expired {
            return None;
        }
        let current = self.open.take()?;
        warn!(
            key = %current.key(),
            open_time = current.open_time,
            "no update crossed the window boundary; flushing possibly under-sampled candle"
        );
        Some(self.finalize(current))
    }

    /// The in-progress candle, if a window is open.
    pub fn snapshot(&self) -> Option<Candle> {
        self.open.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn seed(&self, window: i64, update: Candle) -> Candle {
        Candle {
            open_time: window,
            close_time: window + self.timeframe.duration_ms(),
            timeframe: self.timeframe,
            ..update
        }
    }

    fn merge(&self, current: &mut Candle, update: &Candle) {
        current.high = current.high.max(update.high);
        current.low = current.low.min(update.low);
        current.close = update.close;
        match self.volume_mode {
            VolumeMode::Cumulative => {
                current.volume = update.volume;
                current.quote_volume = update.quote_volume.or(current.quote_volume);
                current.trade_count = update.trade_count;
            }
            VolumeMode::Incremental => {
                current.volume += update.volume;
                current.quote_volume = match (current.quote_volume, update.quote_volume) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                };
                current.trade_count += update.trade_count;
            }
        }
        current.is_closed |= update.is_closed;
    }

    fn finalize(&mut self, mut candle: Candle) -> Candle {
        candle.is_closed = true;
        self.last_finalized = Some(candle.open_time);
        candle
    }
}

// =============================================================================
// AssemblerSet - routes updates to the per-series assembler
// =============================================================================

#[derive(Debug)]
pub struct AssemblerSet {
    volume_mode: VolumeMode,
    assemblers: HashMap<CandleKey, CandleAssembler>,
}

impl AssemblerSet {
    pub fn new(volume_mode: VolumeMode) -> Self {
        Self {
            volume_mode,
            assemblers: HashMap::new(),
        }
    }

    pub fn update(&mut self, update: Candle) -> Vec<Candle> {
        let mode = self.volume_mode;
        self.assemblers
            .entry(update.key())
            .or_insert_with(|| CandleAssembler::new(update.timeframe, mode))
            .update(update)
    }

    pub fn flush_expired(&mut self, now_ms: i64, grace_ms: i64) -> Vec<Candle> {
        let mut flushed: Vec<Candle> = self
            .assemblers
            .values_mut()
            .filter_map(|a| a.flush_expired(now_ms, grace_ms))
            .collect();
        flushed.sort_by_key(|c| c.open_time);
        flushed
    }

    pub fn snapshot(&self, key: &CandleKey) -> Option<Candle> {
        self.assemblers.get(key).and_then(CandleAssembler::snapshot)
    }

    pub fn snapshots(&self) -> Vec<Candle> {
        self.assemblers
            .values()
            .filter_map(CandleAssembler::snapshot)
            .collect()
    }

    pub fn dropped(&self) -> u64 {
        self.assemblers.values().map(CandleAssembler::dropped).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
