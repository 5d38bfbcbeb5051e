// =============================================================================
// Feed Monitor - shared health view of every running feed
// =============================================================================
//
// Pipelines record candles, connection state changes, reconnects and dropped
// events here; the status API reads a serialisable snapshot. A feed whose
// socket keeps failing shows up as a growing `seconds_since_last` rather than
// as an error.
//
// Thread safety:
//   - Atomic counters for the global tallies and the state version.
//   - parking_lot::RwLock for the per-key and per-connection maps.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::exchanges::ConnectionState;
use crate::market_data::{Candle, CandleKey};
use crate::types::{ExchangeId, MarketType};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Feed or connection the error belongs to.
    pub scope: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

struct FeedEntry {
    last: Candle,
    last_seen: Instant,
    closed: u64,
    in_progress: u64,
}

struct ConnectionEntry {
    state: ConnectionState,
    since: Instant,
    reconnects: u64,
    rejected: Vec<String>,
    frames: u64,
    last_frame_at: Option<DateTime<Utc>>,
}

impl ConnectionEntry {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            since: Instant::now(),
            reconnects: 0,
            rejected: Vec::new(),
            frames: 0,
            last_frame_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub key: String,
    pub last_candle: Candle,
    pub seconds_since_last: f64,
    pub closed_candles: u64,
    pub in_progress_updates: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connection: String,
    pub state: ConnectionState,
    pub seconds_in_state: f64,
    pub reconnects: u64,
    pub rejected_symbols: Vec<String>,
    pub frames_received: u64,
    /// Receive time of the newest frame, ISO 8601.
    pub last_frame_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Counters {
    pub schema_errors: u64,
    pub late_updates: u64,
    pub partial_aggregates: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub feeds: Vec<FeedStatus>,
    pub connections: Vec<ConnectionStatus>,
    pub counters: Counters,
    pub recent_errors: Vec<ErrorRecord>,
}

pub struct FeedMonitor {
    state_version: AtomicU64,
    feeds: RwLock<HashMap<CandleKey, FeedEntry>>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    schema_errors: AtomicU64,
    late_updates: AtomicU64,
    partial_aggregates: AtomicU64,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    start_time: Instant,
}

impl Default for FeedMonitor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn connection_name(exchange: ExchangeId, market: MarketType) -> String {
    format!("{exchange}:{market}")
}

impl FeedMonitor {
    pub fn new() -> Self {
        Self {
            state_version: AtomicU64::new(1),
            feeds: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            schema_errors: AtomicU64::new(0),
            late_updates: AtomicU64::new(0),
            partial_aggregates: AtomicU64::new(0),
            recent_errors: RwLock::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Feeds ───────────────────────────────────────────────────────────

    pub fn record_candle(&self, candle: &Candle) {
        let mut feeds = self.feeds.write();
        let entry = feeds.entry(candle.key()).or_insert_with(|| FeedEntry {
            last: candle.clone(),
            last_seen: Instant::now(),
            closed: 0,
            in_progress: 0,
        });
        entry.last = candle.clone();
        entry.last_seen = Instant::now();
        if candle.is_closed {
            entry.closed += 1;
        } else {
            entry.in_progress += 1;
        }
        drop(feeds);
        self.increment_version();
    }

    /// Seconds since the last candle for `key`, if one was ever seen.
    pub fn seconds_since_last(&self, key: &CandleKey) -> Option<f64> {
        self.feeds
            .read()
            .get(key)
            .map(|e| e.last_seen.elapsed().as_secs_f64())
    }

    // ── Connections ─────────────────────────────────────────────────────

    pub fn record_state(&self, exchange: ExchangeId, market: MarketType, state: ConnectionState) {
        let mut conns = self.connections.write();
        let entry = conns
            .entry(connection_name(exchange, market))
            .or_insert_with(|| ConnectionEntry::new(state));
        if entry.state != state {
            entry.state = state;
            entry.since = Instant::now();
        }
        drop(conns);
        self.increment_version();
    }

    /// Note a raw frame read off the socket at `received_at`.
    pub fn record_frame(&self, exchange: ExchangeId, market: MarketType, received_at: DateTime<Utc>) {
        let mut conns = self.connections.write();
        let entry = conns
            .entry(connection_name(exchange, market))
            .or_insert_with(|| ConnectionEntry::new(ConnectionState::Streaming));
        entry.frames += 1;
        if entry.last_frame_at.map_or(true, |last| received_at > last) {
            entry.last_frame_at = Some(received_at);
        }
    }

    pub fn record_reconnect(&self, exchange: ExchangeId, market: MarketType) {
        if let Some(entry) = self.connections.write().get_mut(&connection_name(exchange, market)) {
            entry.reconnects += 1;
        }
        self.increment_version();
    }

    pub fn record_rejected(&self, exchange: ExchangeId, market: MarketType, symbol: &str, reason: &str) {
        let scope = connection_name(exchange, market);
        if let Some(entry) = self.connections.write().get_mut(&scope) {
            if !entry.rejected.iter().any(|s| s == symbol) {
                entry.rejected.push(symbol.to_string());
            }
        }
        self.push_error(format!("subscription for {symbol} rejected: {reason}"), Some(scope));
    }

    pub fn connection_state(&self, exchange: ExchangeId, market: MarketType) -> Option<ConnectionState> {
        self.connections
            .read()
            .get(&connection_name(exchange, market))
            .map(|e| e.state)
    }

    // ── Counters ────────────────────────────────────────────────────────

    pub fn record_schema_error(&self, message: String, scope: Option<String>) {
        self.schema_errors.fetch_add(1, Ordering::Relaxed);
        self.push_error(message, scope);
    }

    pub fn add_late_updates(&self, n: u64) {
        if n > 0 {
            self.late_updates.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_partial_aggregates(&self, n: u64) {
        if n > 0 {
            self.partial_aggregates.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record an error; the ring buffer keeps the latest [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: String, scope: Option<String>) {
        let record = ErrorRecord {
            message,
            scope,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    pub fn build_snapshot(&self) -> MonitorSnapshot {
        let mut feeds: Vec<FeedStatus> = self
            .feeds
            .read()
            .iter()
            .map(|(key, e)| FeedStatus {
                key: key.to_string(),
                last_candle: e.last.clone(),
                seconds_since_last: e.last_seen.elapsed().as_secs_f64(),
                closed_candles: e.closed,
                in_progress_updates: e.in_progress,
            })
            .collect();
        feeds.sort_by(|a, b| a.key.cmp(&b.key));

        let mut connections: Vec<ConnectionStatus> = self
            .connections
            .read()
            .iter()
            .map(|(name, e)| ConnectionStatus {
                connection: name.clone(),
                state: e.state,
                seconds_in_state: e.since.elapsed().as_secs_f64(),
                reconnects: e.reconnects,
                rejected_symbols: e.rejected.clone(),
                frames_received: e.frames,
                last_frame_at: e.last_frame_at.map(|t| t.to_rfc3339()),
            })
            .collect();
        connections.sort_by(|a, b| a.connection.cmp(&b.connection));

        MonitorSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            feeds,
            connections,
            counters: Counters {
                schema_errors: self.schema_errors.load(Ordering::Relaxed),
                late_updates: self.late_updates.load(Ordering::Relaxed),
                partial_aggregates: self.partial_aggregates.load(Ordering::Relaxed),
            },
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}
