// =============================================================================
// Adapter Session - one reconnecting WebSocket per exchange market
// =============================================================================
//
// The session owns the socket; the adapter only says what to send and how to
// read what comes back. On any transport failure the session waits with
// exponential backoff and re-subscribes the surviving symbol set. Symbols the
// exchange rejects are reported once and never re-subscribed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection_state::{ConnectionState, StateTracker};
use super::{AdapterEvent, Decoded, ExchangeAdapter, RawEvent, Subscription};
use crate::error::{ConfigError, TransportError};
use crate::types::Timeframe;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel_capacity: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(2),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `initial * 2^(attempt-1)`
/// capped at `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    initial.saturating_mul(1_u32 << exponent).min(max)
}

enum Outcome {
    /// Socket lost. `streamed` is true once the connection delivered at least
    /// one candle frame; only then does the backoff start over.
    Dropped { streamed: bool },
    /// Cancelled, or nobody is listening any more.
    Stop,
}

// =============================================================================
// AdapterSession
// =============================================================================

pub struct AdapterSession {
    adapter: Arc<dyn ExchangeAdapter>,
    config: SessionConfig,
    url: String,
}

impl AdapterSession {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, config: SessionConfig) -> Self {
        let url = adapter.ws_url();
        Self {
            adapter,
            config,
            url,
        }
    }

    /// Point the session at another endpoint (testnets, local servers).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Validate the subscription, make the first connection attempt and hand
    /// the session to a background task. A failed first attempt is retried by
    /// the task; only configuration problems fail here.
    pub async fn start(
        self,
        cancel: CancellationToken,
        subscription: &Subscription,
    ) -> Result<mpsc::Receiver<AdapterEvent>, ConfigError> {
        subscription.validate_for(self.adapter.as_ref())?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(4));
        let initial = match self.connect().await {
            Ok(ws) => Some(ws),
            Err(e) => {
                warn!(
                    exchange = %self.adapter.id(),
                    url = %self.url,
                    error = %e,
                    "initial connect failed; retrying in background"
                );
                None
            }
        };

        let symbols = subscription.normalized_symbols();
        let timeframe = subscription.base_timeframe;
        tokio::spawn(self.run(cancel, symbols, timeframe, initial, tx));
        Ok(rx)
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        let (ws, _response) = tokio::time::timeout(self.config.connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;
        Ok(ws)
    }

    // -------------------------------------------------------------------------
    // Reconnect loop
    // -------------------------------------------------------------------------

    async fn run(
        self,
        cancel: CancellationToken,
        mut symbols: Vec<String>,
        timeframe: Timeframe,
        mut pending: Option<WsStream>,
        tx: mpsc::Sender<AdapterEvent>,
    ) {
        let exchange = self.adapter.id();
        let mut state = StateTracker::new(exchange, self.adapter.market());
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !self.set_state(&mut state, ConnectionState::Connecting, &tx, &cancel).await {
                break;
            }

            let ws = match pending.take() {
                Some(ws) => ws,
                None => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.connect() => r,
                    };
                    match result {
                        Ok(ws) => ws,
                        Err(e) => {
                            attempt = attempt.saturating_add(1);
                            warn!(exchange = %exchange, attempt, error = %e, "connect failed");
                            if !self.set_state(&mut state, ConnectionState::Disconnected, &tx, &cancel).await
                                || !self.sleep_backoff(attempt, &cancel).await
                            {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            if symbols.is_empty() {
                warn!(exchange = %exchange, "every symbol was rejected; session ending");
                break;
            }

            let reconnect = (attempt > 0).then_some(attempt);
            match self
                .drive(ws, &mut symbols, timeframe, &cancel, &tx, &mut state, reconnect)
                .await
            {
                Outcome::Stop => break,
                Outcome::Dropped { streamed } => {
                    if streamed {
                        attempt = 0;
                    }
                    attempt = attempt.saturating_add(1);
                    if !self.set_state(&mut state, ConnectionState::Disconnected, &tx, &cancel).await
                        || !self.sleep_backoff(attempt, &cancel).await
                    {
                        break;
                    }
                }
            }
        }

        state.transition(ConnectionState::Closed);
        let _ = tokio::time::timeout(
            self.config.close_grace,
            tx.send(AdapterEvent::StateChanged(ConnectionState::Closed)),
        )
        .await;
        info!(exchange = %exchange, "adapter session closed");
    }

    /// One connection lifetime: subscribe, then read until failure or cancel.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        ws: WsStream,
        symbols: &mut Vec<String>,
        timeframe: Timeframe,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AdapterEvent>,
        state: &mut StateTracker,
        reconnect: Option<u32>,
    ) -> Outcome {
        let exchange = self.adapter.id();
        let (mut write, mut read) = ws.split();

        let requests = self.adapter.subscribe_requests(symbols, timeframe, 1);
        let mut by_id: HashMap<u64, Vec<String>> = HashMap::with_capacity(requests.len());
        for (i, req) in requests.into_iter().enumerate() {
            if i > 0 {
                if let Some(pacing) = self.adapter.subscribe_pacing() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.close(&mut write).await;
                            return Outcome::Stop;
                        }
                        _ = tokio::time::sleep(pacing) => {}
                    }
                }
            }
            if let Err(e) = write.send(Message::Text(req.payload)).await {
                warn!(exchange = %exchange, error = %TransportError::from(e), "subscribe send failed");
                return Outcome::Dropped { streamed: false };
            }
            by_id.insert(req.id, req.symbols);
        }
        info!(exchange = %exchange, symbols = symbols.len(), timeframe = %timeframe, "subscriptions sent");

        if !self.set_state(state, ConnectionState::Subscribed, tx, cancel).await {
            self.close(&mut write).await;
            return Outcome::Stop;
        }
        if let Some(attempt) = reconnect {
            info!(exchange = %exchange, attempt, "reconnected and re-subscribed");
            if !emit(tx, AdapterEvent::Reconnected { attempt }, cancel).await {
                self.close(&mut write).await;
                return Outcome::Stop;
            }
        }

        let mut keep_alive = self.adapter.keep_alive().map(|k| {
            let mut interval = tokio::time::interval_at(Instant::now() + k.interval, k.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            (interval, k.payload)
        });

        let mut streamed = false;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    self.close(&mut write).await;
                    return Outcome::Stop;
                }
                payload = next_ping(&mut keep_alive) => {
                    if let Err(e) = write.send(Message::Text(payload)).await {
                        warn!(exchange = %exchange, error = %TransportError::from(e), "keep-alive send failed");
                        return Outcome::Dropped { streamed };
                    }
                    continue;
                }
                next = read.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => match self.adapter.decode(&text) {
                    Decoded::Frames(frames) => {
                        streamed |= !frames.is_empty();
                        if state.current() == ConnectionState::Subscribed
                            && !self.set_state(state, ConnectionState::Streaming, tx, cancel).await
                        {
                            self.close(&mut write).await;
                            return Outcome::Stop;
                        }
                        for fields in frames {
                            let event = AdapterEvent::Frame(RawEvent {
                                source: exchange,
                                fields,
                                received_at: Utc::now(),
                            });
                            if !emit(tx, event, cancel).await {
                                self.close(&mut write).await;
                                return Outcome::Stop;
                            }
                        }
                    }
                    Decoded::Rejected { id, symbol, reason } => {
                        let rejected = symbol
                            .map(|s| vec![s.to_uppercase()])
                            .or_else(|| id.and_then(|id| by_id.get(&id).cloned()))
                            .unwrap_or_default();
                        if rejected.is_empty() {
                            warn!(exchange = %exchange, reason = %reason, "unattributed subscription error");
                        }
                        for sym in rejected {
                            let before = symbols.len();
                            symbols.retain(|s| *s != sym);
                            if symbols.len() == before {
                                continue;
                            }
                            warn!(exchange = %exchange, symbol = %sym, reason = %reason, "subscription rejected; symbol dropped");
                            let event = AdapterEvent::Rejected {
                                symbol: sym,
                                reason: reason.clone(),
                            };
                            if !emit(tx, event, cancel).await {
                                self.close(&mut write).await;
                                return Outcome::Stop;
                            }
                        }
                    }
                    Decoded::Ack { id } => {
                        debug!(exchange = %exchange, id = ?id, "subscription acknowledged");
                    }
                    Decoded::Pong => debug!(exchange = %exchange, "pong"),
                    Decoded::Ignore => debug!(exchange = %exchange, len = text.len(), "frame ignored"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(exchange = %exchange, frame = ?frame, "server closed the connection");
                    return Outcome::Dropped { streamed };
                }
                // Ping / Pong / Binary: tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(exchange = %exchange, error = %TransportError::from(e), "websocket read error");
                    return Outcome::Dropped { streamed };
                }
                None => {
                    warn!(exchange = %exchange, error = %TransportError::Closed, "websocket stream ended");
                    return Outcome::Dropped { streamed };
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn close(&self, write: &mut WsWrite) {
        let closing = async {
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        };
        if tokio::time::timeout(self.config.close_grace, closing).await.is_err() {
            debug!(exchange = %self.adapter.id(), "close handshake exceeded grace period");
        }
    }

    async fn set_state(
        &self,
        state: &mut StateTracker,
        next: ConnectionState,
        tx: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        if !state.transition(next) {
            return true;
        }
        emit(tx, AdapterEvent::StateChanged(next), cancel).await
    }

    /// Returns false when cancelled during the wait.
    async fn sleep_backoff(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        let delay = backoff_delay(self.config.backoff_initial, self.config.backoff_max, attempt);
        info!(
            exchange = %self.adapter.id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after backoff"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Send `event`, giving up on cancellation. False when the event was not
/// delivered.
async fn emit(tx: &mpsc::Sender<AdapterEvent>, event: AdapterEvent, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        r = tx.send(event) => r.is_ok(),
    }
}

async fn next_ping(keep_alive: &mut Option<(Interval, String)>) -> String {
    match keep_alive {
        Some((interval, payload)) => {
            interval.tick().await;
            payload.clone()
        }
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::binance::BinanceAdapter;
    use crate::types::{ExchangeId, MarketType};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn kline(t: i64) -> String {
        json!({
            "e": "kline", "s": "BTCUSDT",
            "k": { "t": t, "T": t + 59_999, "s": "BTCUSDT", "i": "1m",
                   "o": "1", "h": "2", "l": "0.5", "c": "1.5",
                   "v": "3", "q": "4", "n": 5, "x": false }
        })
        .to_string()
    }

    fn subscription(symbols: &[&str]) -> Subscription {
        Subscription {
            exchange: ExchangeId::Binance,
            market_type: MarketType::Spot,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            base_timeframe: Timeframe::M1,
            aggregate_timeframes: Vec::new(),
            warmup: false,
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(initial, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(initial, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(initial, max, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(initial, max, 5), max);
        assert_eq!(backoff_delay(initial, max, 500), max);
    }

    #[tokio::test]
    async fn empty_symbol_set_fails_start() {
        let adapter = Arc::new(BinanceAdapter::new(MarketType::Spot));
        let session = AdapterSession::new(adapter, fast_config()).with_url("ws://127.0.0.1:1");
        let err = session
            .start(CancellationToken::new(), &subscription(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoSymbols { .. }));
    }

    #[tokio::test]
    async fn backoff_keeps_growing_while_server_hangs_up_after_subscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut ws) = accept_async(tcp).await else {
                    continue;
                };
                let _ = ws.next().await;
                let _ = ws.close(None).await;
            }
        });

        let adapter = Arc::new(BinanceAdapter::new(MarketType::Spot));
        let session = AdapterSession::new(adapter, fast_config()).with_url(format!("ws://{addr}"));
        let cancel = CancellationToken::new();
        let mut rx = session
            .start(cancel.clone(), &subscription(&["BTCUSDT"]))
            .await
            .unwrap();

        let mut attempts = Vec::new();
        let collected = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if let AdapterEvent::Reconnected { attempt } = event {
                    attempts.push(attempt);
                    if attempts.len() == 3 {
                        break;
                    }
                }
            }
        })
        .await;
        cancel.cancel();
        assert!(collected.is_ok(), "session stopped reconnecting");
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn streams_frames_drops_rejected_symbol_and_resubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            // First connection: reject the second symbol, push a kline, hang up.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for _ in 0..2 {
                if let Some(Ok(Message::Text(t))) = ws.next().await {
                    seen_tx.send(t).unwrap();
                }
            }
            ws.send(Message::Text(
                r#"{"error":{"code":2,"msg":"Invalid symbol"},"id":2}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(kline(1_700_000_040_000))).await.unwrap();
            let _ = ws.close(None).await;
            drop(ws);

            // Second connection: only the surviving symbol comes back.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(t))) = ws.next().await {
                seen_tx.send(t).unwrap();
            }
            ws.send(Message::Text(kline(1_700_000_100_000))).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let adapter = Arc::new(BinanceAdapter::new(MarketType::Spot));
        let session = AdapterSession::new(adapter, fast_config()).with_url(format!("ws://{addr}"));
        let cancel = CancellationToken::new();
        let mut rx = session
            .start(cancel.clone(), &subscription(&["BTCUSDT", "FOOUSDT"]))
            .await
            .unwrap();

        let mut frames = 0;
        let mut rejected = Vec::new();
        let mut reconnected = false;
        let collected = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                match event {
                    AdapterEvent::Frame(_) => frames += 1,
                    AdapterEvent::Rejected { symbol, .. } => rejected.push(symbol),
                    AdapterEvent::Reconnected { .. } => reconnected = true,
                    AdapterEvent::StateChanged(_) => {}
                }
                if frames == 2 {
                    break;
                }
            }
        })
        .await;
        assert!(collected.is_ok(), "session did not deliver both frames");
        assert_eq!(rejected, vec!["FOOUSDT".to_string()]);
        assert!(reconnected);

        let mut subscribes = Vec::new();
        while let Ok(t) = seen_rx.try_recv() {
            subscribes.push(t);
        }
        assert_eq!(subscribes.len(), 3);
        assert!(subscribes[2].contains("btcusdt@kline_1m"));
        assert!(!subscribes[2].contains("foousdt"));

        cancel.cancel();
        let mut last = None;
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                last = Some(event);
            }
        })
        .await;
        assert!(drained.is_ok());
        assert!(matches!(
            last,
            Some(AdapterEvent::StateChanged(ConnectionState::Closed))
        ));
    }
}
