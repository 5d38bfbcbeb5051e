// =============================================================================
// Feed Pipeline - one task per subscription
// =============================================================================
//
//   AdapterEvent ─▶ AliasResolver ─▶ AssemblerSet ─▶ [TimeframeAggregator] ─▶ out
//
// The pipeline task owns the assemblers and accumulators; nothing else touches
// them. Open windows are discarded when the task stops.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::exchanges::{AdapterEvent, RawEvent, Subscription};
use crate::market_data::{AliasResolver, AssemblerSet, Candle, TimeframeAggregator};
use crate::monitor::{connection_name, FeedMonitor};
use crate::types::{ExchangeId, MarketType, Timeframe, VolumeMode};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Forward the in-progress candle after every update.
    pub emit_in_progress: bool,
    /// Forward aggregates completed while seeding from warmup.
    pub emit_warmup: bool,
    /// How long past its end an open window may wait for a final update.
    pub stale_window_grace: Duration,
    pub flush_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            emit_in_progress: false,
            emit_warmup: false,
            stale_window_grace: Duration::from_secs(10),
            flush_interval: Duration::from_secs(1),
        }
    }
}

pub struct FeedPipeline {
    exchange: ExchangeId,
    market: MarketType,
    base: Timeframe,
    resolver: Arc<AliasResolver>,
    assemblers: AssemblerSet,
    aggregator: Option<TimeframeAggregator>,
    monitor: Arc<FeedMonitor>,
    settings: PipelineSettings,
    pending: Vec<Candle>,
    seen_dropped: u64,
    seen_partial: u64,
}

impl FeedPipeline {
    pub fn new(
        subscription: &Subscription,
        volume_mode: VolumeMode,
        resolver: Arc<AliasResolver>,
        monitor: Arc<FeedMonitor>,
        settings: PipelineSettings,
    ) -> Result<Self, ConfigError> {
        subscription.validate()?;
        let aggregator = if subscription.aggregate_timeframes.is_empty() {
            None
        } else {
            Some(TimeframeAggregator::new(
                subscription.base_timeframe,
                &subscription.aggregate_timeframes,
            )?)
        };
        Ok(Self {
            exchange: subscription.exchange,
            market: subscription.market_type,
            base: subscription.base_timeframe,
            resolver,
            assemblers: AssemblerSet::new(volume_mode),
            aggregator,
            monitor,
            settings,
            pending: Vec::new(),
            seen_dropped: 0,
            seen_partial: 0,
        })
    }

    /// Base candles needed before streaming; 0 without aggregates.
    pub fn warmup_horizon(&self) -> usize {
        self.aggregator
            .as_ref()
            .map_or(0, TimeframeAggregator::warmup_horizon)
    }

    /// Seed the aggregator for `symbol`. Completed aggregates are queued for
    /// output only when `emit_warmup` is set.
    pub fn seed(&mut self, symbol: &str, warmup: &[Candle]) {
        let Some(agg) = self.aggregator.as_mut() else {
            return;
        };
        let completed = agg.seed(symbol, warmup);
        if self.settings.emit_warmup {
            self.pending.extend(completed);
        }
        self.sync_counters();
    }

    /// Apply one session event and return the candles ready for output.
    pub fn handle(&mut self, event: AdapterEvent) -> Vec<Candle> {
        match event {
            AdapterEvent::Frame(raw) => self.handle_frame(raw),
            AdapterEvent::Rejected { symbol, reason } => {
                warn!(exchange = %self.exchange, symbol = %symbol, reason = %reason, "symbol dropped from feed");
                self.monitor
                    .record_rejected(self.exchange, self.market, &symbol, &reason);
                Vec::new()
            }
            AdapterEvent::Reconnected { attempt } => {
                debug!(exchange = %self.exchange, attempt, "feed reconnected");
                self.monitor.record_reconnect(self.exchange, self.market);
                Vec::new()
            }
            AdapterEvent::StateChanged(state) => {
                self.monitor.record_state(self.exchange, self.market, state);
                Vec::new()
            }
        }
    }

    fn handle_frame(&mut self, raw: RawEvent) -> Vec<Candle> {
        self.monitor
            .record_frame(self.exchange, self.market, raw.received_at);
        let candle = match self.resolver.resolve(&raw.fields, raw.source.as_str()) {
            Ok(c) => c,
            Err(e) => {
                warn!(exchange = %raw.source, error = %e, "dropping unusable frame");
                self.monitor.record_schema_error(
                    e.to_string(),
                    Some(connection_name(self.exchange, self.market)),
                );
                return Vec::new();
            }
        };
        if candle.timeframe != self.base {
            debug!(key = %candle.key(), "frame for an unsubscribed timeframe");
            return Vec::new();
        }

        let key = candle.key();
        let is_closed = candle.is_closed;
        let closed = self.assemblers.update(candle);
        let mut out = self.finalize(closed);
        if self.settings.emit_in_progress && !is_closed {
            if let Some(live) = self.assemblers.snapshot(&key) {
                out.push(live);
            }
        }
        self.record(&out);
        out
    }

    /// Close windows whose end passed more than the grace period ago.
    pub fn flush(&mut self, now_ms: i64) -> Vec<Candle> {
        let grace_ms = self.settings.stale_window_grace.as_millis() as i64;
        let flushed = self.assemblers.flush_expired(now_ms, grace_ms);
        let out = self.finalize(flushed);
        self.record(&out);
        out
    }

    fn finalize(&mut self, closed: Vec<Candle>) -> Vec<Candle> {
        let mut out = Vec::with_capacity(closed.len());
        for candle in closed {
            let aggregates = self
                .aggregator
                .as_mut()
                .map(|agg| agg.push(&candle))
                .unwrap_or_default();
            out.push(candle);
            out.extend(aggregates);
        }
        self.sync_counters();
        out
    }

    fn record(&self, out: &[Candle]) {
        for candle in out {
            self.monitor.record_candle(candle);
        }
    }

    fn sync_counters(&mut self) {
        let dropped = self.assemblers.dropped();
        self.monitor.add_late_updates(dropped - self.seen_dropped);
        self.seen_dropped = dropped;

        if let Some(agg) = &self.aggregator {
            let partial = agg.partial_emitted();
            self.monitor.add_partial_aggregates(partial - self.seen_partial);
            self.seen_partial = partial;
        }
    }

    /// Drive the pipeline until the event stream ends or `cancel` fires.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<AdapterEvent>,
        out: mpsc::Sender<Candle>,
        cancel: CancellationToken,
    ) {
        let feed = connection_name(self.exchange, self.market);
        info!(feed = %feed, base = %self.base, "pipeline started");

        let pending = std::mem::take(&mut self.pending);
        if !forward(&out, pending, &cancel).await {
            return;
        }

        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let ready = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = ticker.tick() => self.flush(Utc::now().timestamp_millis()),
            };
            if !forward(&out, ready, &cancel).await {
                break;
            }
        }

        let open = self.assemblers.snapshots().len();
        info!(feed = %feed, open_windows_discarded = open, "pipeline stopped");
    }
}

/// Send `candles` in order; false once the receiver is gone or `cancel` fires.
async fn forward(out: &mpsc::Sender<Candle>, candles: Vec<Candle>, cancel: &CancellationToken) -> bool {
    for candle in candles {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            sent = out.send(candle) => if sent.is_err() {
                return false;
            },
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::ConnectionState;
    use crate::market_data::RawFields;
    use serde_json::json;

    const T0: i64 = 1_700_000_100_000; // 5m-aligned

    fn subscription(aggregates: Vec<Timeframe>) -> Subscription {
        Subscription {
            exchange: ExchangeId::Binance,
            market_type: MarketType::Spot,
            symbols: vec!["BTCUSDT".into()],
            base_timeframe: Timeframe::M1,
            aggregate_timeframes: aggregates,
            warmup: false,
        }
    }

    fn pipeline(aggregates: Vec<Timeframe>, settings: PipelineSettings) -> (FeedPipeline, Arc<FeedMonitor>) {
        let monitor = Arc::new(FeedMonitor::new());
        let p = FeedPipeline::new(
            &subscription(aggregates),
            VolumeMode::Cumulative,
            Arc::new(AliasResolver::standard().unwrap()),
            monitor.clone(),
            settings,
        )
        .unwrap();
        (p, monitor)
    }

    fn frame(t: i64, close: f64, volume: f64, closed: bool) -> AdapterEvent {
        let fields: RawFields = json!({
            "s": "BTCUSDT", "i": "1m", "t": t, "T": t + 59_999,
            "o": "100", "h": (close.max(100.0) + 1.0).to_string(), "l": "99",
            "c": close.to_string(), "v": volume.to_string(), "x": closed,
        })
        .as_object()
        .cloned()
        .unwrap();
        AdapterEvent::Frame(RawEvent {
            source: ExchangeId::Binance,
            fields,
            received_at: Utc::now(),
        })
    }

    #[test]
    fn five_closed_minutes_yield_one_five_minute_candle() {
        assert_eq!(Timeframe::M5.window_start(T0), T0);
        let (mut p, monitor) = pipeline(vec![Timeframe::M5], PipelineSettings::default());

        let mut out = Vec::new();
        for i in 0..5 {
            out.extend(p.handle(frame(T0 + i * 60_000, 101.0 + i as f64, 10.0, false)));
            out.extend(p.handle(frame(T0 + i * 60_000, 101.0 + i as f64, 12.0, true)));
        }

        let base: Vec<_> = out.iter().filter(|c| c.timeframe == Timeframe::M1).collect();
        let agg: Vec<_> = out.iter().filter(|c| c.timeframe == Timeframe::M5).collect();
        assert_eq!(base.len(), 5);
        assert!(base.iter().all(|c| c.is_closed && c.volume == 12.0));
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].open_time, T0);
        assert_eq!(agg[0].close, 105.0);
        assert_eq!(agg[0].volume, 60.0);
        assert_eq!(monitor.build_snapshot().feeds.len(), 2);
    }

    #[test]
    fn in_progress_snapshots_are_opt_in() {
        let settings = PipelineSettings {
            emit_in_progress: true,
            ..Default::default()
        };
        let (mut p, _) = pipeline(vec![], settings);
        let out = p.handle(frame(T0, 101.0, 3.0, false));
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_closed);

        let (mut quiet, _) = pipeline(vec![], PipelineSettings::default());
        assert!(quiet.handle(frame(T0, 101.0, 3.0, false)).is_empty());
    }

    #[test]
    fn bad_frames_and_state_reach_the_monitor() {
        let (mut p, monitor) = pipeline(vec![], PipelineSettings::default());
        let bad = AdapterEvent::Frame(RawEvent {
            source: ExchangeId::Binance,
            fields: json!({"s": "BTCUSDT", "i": "1m", "t": T0}).as_object().cloned().unwrap(),
            received_at: Utc::now(),
        });
        assert!(p.handle(bad).is_empty());
        p.handle(AdapterEvent::StateChanged(ConnectionState::Connecting));

        let snap = monitor.build_snapshot();
        assert_eq!(snap.counters.schema_errors, 1);
        assert_eq!(snap.connections[0].frames_received, 1);
        assert_eq!(
            monitor.connection_state(ExchangeId::Binance, MarketType::Spot),
            Some(ConnectionState::Connecting)
        );
    }

    #[test]
    fn stale_window_is_flushed_after_grace() {
        let (mut p, _) = pipeline(vec![], PipelineSettings::default());
        p.handle(frame(T0, 101.0, 3.0, false));
        assert!(p.flush(T0 + 60_000 + 5_000).is_empty());
        let flushed = p.flush(T0 + 60_000 + 10_001);
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].is_closed);
    }

    #[test]
    fn warmup_aggregates_only_emitted_when_asked() {
        let warm: Vec<Candle> = (0..5)
            .map(|i| Candle {
                source: "binance".into(),
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::M1,
                open_time: T0 + i * 60_000,
                close_time: T0 + (i + 1) * 60_000,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
                quote_volume: None,
                trade_count: 0,
                is_closed: true,
            })
            .collect();

        let (mut quiet, _) = pipeline(vec![Timeframe::M5], PipelineSettings::default());
        quiet.seed("BTCUSDT", &warm);
        assert!(quiet.pending.is_empty());

        let settings = PipelineSettings {
            emit_warmup: true,
            ..Default::default()
        };
        let (mut loud, _) = pipeline(vec![Timeframe::M5], settings);
        assert_eq!(loud.warmup_horizon(), 5);
        loud.seed("BTCUSDT", &warm);
        assert_eq!(loud.pending.len(), 1);
    }

    #[tokio::test]
    async fn run_forwards_until_events_end() {
        let (p, _) = pipeline(vec![], PipelineSettings::default());
        let (ev_tx, ev_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let task = tokio::spawn(p.run(ev_rx, out_tx, CancellationToken::new()));

        ev_tx.send(frame(T0, 101.0, 1.0, true)).await.unwrap();
        ev_tx.send(frame(T0 + 60_000, 102.0, 1.0, true)).await.unwrap();
        drop(ev_tx);
        task.await.unwrap();

        let mut got = Vec::new();
        while let Some(c) = out_rx.recv().await {
            got.push(c.open_time);
        }
        assert_eq!(got, vec![T0, T0 + 60_000]);
    }
}
