use crate::{error::ConfigError, timeframe::Timeframe};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default ceiling on concurrently open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1_000;

/// Default number of completed candles retained per (symbol, timeframe).
pub const DEFAULT_TICK_BUFFER_SIZE: usize = 500;

/// Default soft capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Upper bound on [`EngineConfig::out_of_order_tolerance`].
pub const MAX_OUT_OF_ORDER_TOLERANCE: Duration = Duration::from_secs(86_400);

/// Validated, typed configuration injected into a [`CandleEngine`](crate::engine::CandleEngine).
///
/// Construct with [`EngineConfig::default`] and the `with_*` builder methods (or deserialise),
/// then call [`EngineConfig::validate`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of open (connecting, active or draining) connections.
    pub max_connections: usize,
    /// Rolling history length per (symbol, timeframe).
    pub tick_buffer_size: usize,
    /// Grace window for ticks arriving earlier than the open bucket start.
    #[serde(with = "duration_ms")]
    pub out_of_order_tolerance: Duration,
    /// Timeframes used when a subscribe request does not name any.
    pub default_timeframes: Vec<Timeframe>,
    /// Soft capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Connections that fail to acknowledge a heartbeat within this window are dropped.
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Flush queued messages before closing a gracefully disconnected connection.
    pub drain_on_disconnect: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tick_buffer_size: DEFAULT_TICK_BUFFER_SIZE,
            out_of_order_tolerance: Duration::from_secs(2),
            default_timeframes: vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1],
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            drain_on_disconnect: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_tick_buffer_size(mut self, size: usize) -> Self {
        self.tick_buffer_size = size;
        self
    }

    pub fn with_out_of_order_tolerance(mut self, tolerance: Duration) -> Self {
        self.out_of_order_tolerance = tolerance;
        self
    }

    pub fn with_default_timeframes(mut self, timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        self.default_timeframes = timeframes.into_iter().collect();
        self
    }

    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_drain_on_disconnect(mut self, drain: bool) -> Self {
        self.drain_on_disconnect = drain;
        self
    }

    /// Check every field, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("max_connections", self.max_connections),
            ("tick_buffer_size", self.tick_buffer_size),
            ("outbound_queue_capacity", self.outbound_queue_capacity),
        ];
        if let Some((field, _)) = non_zero.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "heartbeat_interval",
            });
        }

        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeout {
                interval_ms: self.heartbeat_interval.as_millis() as u64,
                timeout_ms: self.heartbeat_timeout.as_millis() as u64,
            });
        }

        if self.out_of_order_tolerance > MAX_OUT_OF_ORDER_TOLERANCE {
            return Err(ConfigError::ToleranceTooLarge {
                tolerance_ms: self.out_of_order_tolerance.as_millis() as u64,
                max_ms: MAX_OUT_OF_ORDER_TOLERANCE.as_millis() as u64,
            });
        }

        if self.default_timeframes.is_empty() {
            return Err(ConfigError::NoDefaultTimeframes);
        }

        Ok(())
    }

    /// Out-of-order tolerance as a [`TimeDelta`] for timestamp arithmetic.
    pub fn tolerance(&self) -> TimeDelta {
        TimeDelta::from_std(self.out_of_order_tolerance).unwrap_or(TimeDelta::MAX)
    }
}

/// (De)serialise a [`Duration`] as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
