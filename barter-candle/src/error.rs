use crate::connection::{ConnectionId, ConnectionState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `barter-candle`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("connection capacity reached: {max} connections already open")]
    Capacity { max: usize },

    #[error("transport failure on connection {connection}: {reason}")]
    Transport {
        connection: ConnectionId,
        reason: String,
    },

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {connection} cannot transition from {from} to {to}")]
    InvalidTransition {
        connection: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("connection {connection} is {state}, subscriptions require an active connection")]
    NotActive {
        connection: ConnectionId,
        state: ConnectionState,
    },

    #[error("candle engine has been shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Stable code sent to clients in an `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Capacity { .. } => "CAPACITY_ERROR",
            EngineError::Transport { .. } => "TRANSPORT_ERROR",
            EngineError::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            EngineError::InvalidTransition { .. } | EngineError::NotActive { .. } => {
                "INVALID_STATE"
            }
            EngineError::ShutDown => "SHUT_DOWN",
            EngineError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Determine if an error requires the affected connection to be forcibly closed.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            EngineError::Transport { .. } => true,
            EngineError::UnknownConnection(_) => true,
            _ => false,
        }
    }
}

/// Input rejected at the engine boundary before it can reach aggregator state.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum ValidationError {
    #[error("invalid symbol {0:?}: expected 1-32 characters of [A-Za-z0-9-_/.:]")]
    Symbol(String),

    #[error("invalid timeframe {0:?}: expected <count><s|m|h|d|w>, eg/ 1m, 15m, 4h")]
    Timeframe(String),

    #[error("invalid price {0}: must be finite and greater than zero")]
    Price(String),

    #[error("invalid size {0}: must be finite and non-negative")]
    Size(String),

    #[error("malformed message: {0}")]
    Message(String),

    #[error("subscription request is empty: at least one symbol is required")]
    EmptySubscription,
}

/// Invalid [`EngineConfig`](crate::config::EngineConfig) field.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("default_timeframes must contain at least one timeframe")]
    NoDefaultTimeframes,

    #[error(
        "heartbeat_timeout ({timeout_ms}ms) must be at least heartbeat_interval ({interval_ms}ms)"
    )]
    HeartbeatTimeout { interval_ms: u64, timeout_ms: u64 },

    #[error("out_of_order_tolerance ({tolerance_ms}ms) exceeds the {max_ms}ms maximum")]
    ToleranceTooLarge { tolerance_ms: u64, max_ms: u64 },

    #[error("failed to parse {field}: {value:?}")]
    Parse { field: &'static str, value: String },
}

/// Failure writing to a single connection's transport.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum TransportError {
    #[error("transport closed by peer")]
    Closed,

    #[error("transport write failed: {0}")]
    Write(String),
}
