// =============================================================================
// Error taxonomy for the ingestion pipeline
// =============================================================================
//
// Each variant family has a fixed recovery policy:
//   - SchemaError     -> drop the single event, log, keep going.
//   - TransportError  -> reconnect / retry with backoff, never fatal.
//   - ConfigError     -> abort the affected subscription at startup.
//   - SinkError       -> isolated to the failing sink.
//   - BackfillError   -> surfaced to the caller (runner decides).
// =============================================================================

use thiserror::Error;

/// A raw event could not be turned into a canonical candle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("[{source_id}] required field '{field}' missing after alias resolution")]
    MissingField {
        field: &'static str,
        source_id: String,
    },

    #[error("[{source_id}] field '{field}' has an unusable value: {value}")]
    InvalidValue {
        field: &'static str,
        value: String,
        source_id: String,
    },

    #[error("unknown timeframe '{0}'")]
    UnknownTimeframe(String),

    #[error("candle invariant violated: {0}")]
    InvariantViolated(String),
}

/// Socket or HTTP failure. Always retried by the owner.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("connection closed by peer")]
    Closed,
}

/// Invalid configuration detected before the pipeline starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("aggregate timeframe {target} is not a strict multiple of base timeframe {base}")]
    InvalidAggregate { base: String, target: String },

    #[error("subscription for {exchange} has no symbols")]
    NoSymbols { exchange: String },

    #[error("symbol '{symbol}' listed more than once for {exchange}")]
    DuplicateSymbol { exchange: String, symbol: String },

    #[error("{exchange} cannot stream timeframe {timeframe}")]
    UnsupportedTimeframe { exchange: String, timeframe: String },

    #[error("alias '{alias}' is mapped to both '{first}' and '{second}'")]
    AmbiguousAlias {
        alias: String,
        first: &'static str,
        second: &'static str,
    },

    #[error("canonical field '{0}' has no aliases")]
    EmptyAliasList(&'static str),

    #[error("invalid backfill range: {0}")]
    InvalidRange(String),

    #[error("invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// A single sink failed to accept a candle.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink '{sink}' failed: {source}")]
    Failed {
        sink: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("sink '{sink}' timed out after {timeout_ms} ms")]
    Timeout { sink: String, timeout_ms: u64 },
}

/// Historical REST retrieval failed.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{exchange} returned HTTP {status}: {body}")]
    Status {
        exchange: String,
        status: u16,
        body: String,
    },

    #[error("{exchange} api error {code}: {message}")]
    Api {
        exchange: String,
        code: String,
        message: String,
    },

    #[error("{exchange} rate limit hit; retry after {retry_after:?}")]
    RateLimited {
        exchange: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("{exchange} has temporarily banned this client (HTTP {status})")]
    Banned { exchange: String, status: u16 },

    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cancelled")]
    Cancelled,
}

impl BackfillError {
    /// The exchange asked us to slow down; the same request may be retried
    /// after a pause.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
