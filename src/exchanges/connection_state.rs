// =============================================================================
// Connection state machine for adapter sessions
// =============================================================================
//
//   Disconnected -> Connecting -> Subscribed -> Streaming
//        ^              |             |            |
//        +--------------+-------------+------------+   (error / remote close)
//
//   any state -> Closed   (shutdown; terminal)
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{ExchangeId, MarketType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Subscribed) | (Connecting, Disconnected) => true,
            (Subscribed, Streaming) | (Subscribed, Disconnected) => true,
            (Streaming, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Tracks and logs the state of one session.
#[derive(Debug)]
pub struct StateTracker {
    exchange: ExchangeId,
    market: MarketType,
    current: ConnectionState,
}

impl StateTracker {
    pub fn new(exchange: ExchangeId, market: MarketType) -> Self {
        Self {
            exchange,
            market,
            current: ConnectionState::Disconnected,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }

    /// Move to `next`. Returns `false` (and leaves the state unchanged) when
    /// the transition is not allowed or is a no-op.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.current == next {
            return false;
        }
        if !self.current.can_transition_to(next) {
            warn!(
                exchange = %self.exchange,
                market = %self.market,
                from = %self.current,
                to = %next,
                "illegal connection state transition ignored"
            );
            return false;
        }
        info!(
            exchange = %self.exchange,
            market = %self.market,
            from = %self.current,
            to = %next,
            "connection state changed"
        );
        self.current = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_and_reconnect_cycle() {
        let mut t = StateTracker::new(ExchangeId::Binance, MarketType::Spot);
        assert!(t.transition(ConnectionState::Connecting));
        assert!(t.transition(ConnectionState::Subscribed));
        assert!(t.transition(ConnectionState::Streaming));
        assert!(t.transition(ConnectionState::Disconnected));
        assert!(t.transition(ConnectionState::Connecting));
        assert!(t.transition(ConnectionState::Closed));
        assert_eq!(t.current(), ConnectionState::Closed);
    }

    #[test]
    fn closed_is_terminal_and_skips_are_rejected() {
        let mut t = StateTracker::new(ExchangeId::Okx, MarketType::Spot);
        assert!(!t.transition(ConnectionState::Streaming));
        assert!(!t.transition(ConnectionState::Disconnected));
        assert!(t.transition(ConnectionState::Closed));
        assert!(!t.transition(ConnectionState::Connecting));
    }
}
