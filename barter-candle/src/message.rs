//! JSON wire protocol spoken between the engine and its clients.
//!
//! Client requests are tagged by `action`, server messages are tagged by `type`.

use crate::{
    candle::{AggregatorKey, Candle},
    connection::{ConnectionId, ConnectionStats, broker::BrokerStats},
    error::{EngineError, ValidationError},
    registry::RegistryStats,
    tick::parse_symbol,
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;

/// Request sent by a client over its connection.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscriptionRequest),
    Unsubscribe(SubscriptionRequest),
    /// Heartbeat acknowledgement.
    #[serde(alias = "pong")]
    Heartbeat,
    Stats,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(text).map_err(|error| ValidationError::Message(error.to_string()))
    }
}

/// Raw, unvalidated symbols and timeframes of a subscribe or unsubscribe request.
#[derive(Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub timeframes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<Vec<String>>,
}

/// Validated [`SubscriptionRequest`].
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Subscription {
    pub symbols: IndexSet<SmolStr>,
    /// Empty when the request named no timeframes.
    pub timeframes: IndexSet<Timeframe>,
    pub indicators: Option<Vec<SmolStr>>,
}

impl SubscriptionRequest {
    /// Validate every symbol and timeframe, failing on the first invalid entry.
    pub fn validate(&self) -> Result<Subscription, ValidationError> {
        if self.symbols.is_empty() {
            return Err(ValidationError::EmptySubscription);
        }

        let symbols = self
            .symbols
            .iter()
            .map(|symbol| parse_symbol(symbol))
            .collect::<Result<IndexSet<_>, _>>()?;

        let timeframes = self
            .timeframes
            .iter()
            .map(|timeframe| timeframe.parse::<Timeframe>())
            .collect::<Result<IndexSet<_>, _>>()?;

        let indicators = self
            .indicators
            .as_ref()
            .map(|indicators| indicators.iter().map(SmolStr::from).collect());

        Ok(Subscription {
            symbols,
            timeframes,
            indicators,
        })
    }
}

impl Subscription {
    /// Every (symbol, timeframe) pair, falling back to `defaults` when no timeframe was named.
    pub fn keys(&self, defaults: &[Timeframe]) -> IndexSet<AggregatorKey> {
        let timeframes = if self.timeframes.is_empty() {
            defaults.iter().copied().collect()
        } else {
            self.timeframes.clone()
        };

        self.symbols
            .iter()
            .cartesian_product(timeframes.iter())
            .map(|(symbol, timeframe)| AggregatorKey::new(symbol.clone(), *timeframe))
            .collect()
    }

    /// Whether `key` is named by this request. No timeframes matches every timeframe of a symbol.
    pub fn matches(&self, key: &AggregatorKey) -> bool {
        self.symbols.contains(&key.symbol)
            && (self.timeframes.is_empty() || self.timeframes.contains(&key.timeframe))
    }
}

/// Candle as it appears on the wire, `bucketStart` in epoch seconds.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleMessage {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    pub tick_count: u64,
    pub is_complete: bool,
}

impl From<&Candle> for CandleMessage {
    fn from(candle: &Candle) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe,
            bucket_start: candle.bucket_start.timestamp(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            vwap: candle.vwap,
            tick_count: candle.tick_count,
            is_complete: candle.is_complete,
        }
    }
}

/// Message sent by the engine to a client.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Candle(CandleMessage),
    Error {
        code: String,
        message: String,
    },
    Welcome {
        connection_id: ConnectionId,
    },
    /// Epoch milliseconds; clients acknowledge with a `heartbeat` action.
    Heartbeat {
        ts: i64,
    },
    Subscribed {
        subscriptions: Vec<AggregatorKey>,
        indicators: Vec<SmolStr>,
    },
    History {
        symbol: SmolStr,
        timeframe: Timeframe,
        candles: Vec<CandleMessage>,
    },
    Stats {
        connection: ConnectionStats,
        broker: BrokerStats,
        registry: RegistryStats,
    },
}

impl ServerMessage {
    pub fn heartbeat(time: DateTime<Utc>) -> Self {
        Self::Heartbeat {
            ts: time.timestamp_millis(),
        }
    }

    pub fn history(key: &AggregatorKey, candles: &[Candle]) -> Self {
        Self::History {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            candles: candles.iter().map(CandleMessage::from).collect(),
        }
    }

    /// Serialise to the shared payload enqueued onto connection queues.
    pub fn to_payload(&self) -> Arc<str> {
        match serde_json::to_string(self) {
            Ok(json) => Arc::from(json),
            // Only reachable with non-string map keys, which no variant contains
            Err(error) => Arc::from(format!(
                r#"{{"type":"error","code":"INTERNAL_ERROR","message":{:?}}}"#,
                error.to_string()
            )),
        }
    }
}

impl From<&EngineError> for ServerMessage {
    fn from(error: &EngineError) -> Self {
        Self::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_client_message_parse() {
        struct TestCase {
            input: &'static str,
            expected: Result<ClientMessage, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: subscribe with symbols, timeframes and indicators
                input: r#"{"action":"subscribe","symbols":["btcusdt"],"timeframes":["1m","5m"],"indicators":["rsi"]}"#,
                expected: Ok(ClientMessage::Subscribe(SubscriptionRequest {
                    symbols: vec!["btcusdt".to_string()],
                    timeframes: vec!["1m".to_string(), "5m".to_string()],
                    indicators: Some(vec!["rsi".to_string()]),
                })),
            },
            TestCase {
                // TC1: unsubscribe without timeframes
                input: r#"{"action":"unsubscribe","symbols":["ETHUSDT"]}"#,
                expected: Ok(ClientMessage::Unsubscribe(SubscriptionRequest {
                    symbols: vec!["ETHUSDT".to_string()],
                    timeframes: vec![],
                    indicators: None,
                })),
            },
            TestCase {
                // TC2: heartbeat acknowledgement
                input: r#"{"action":"heartbeat"}"#,
                expected: Ok(ClientMessage::Heartbeat),
            },
            TestCase {
                // TC3: pong alias
                input: r#"{"action":"pong"}"#,
                expected: Ok(ClientMessage::Heartbeat),
            },
            TestCase {
                // TC4: stats request
                input: r#"{"action":"stats"}"#,
                expected: Ok(ClientMessage::Stats),
            },
            TestCase {
                // TC5: unknown action
                input: r#"{"action":"trade"}"#,
                expected: Err(()),
            },
            TestCase {
                // TC6: not json
                input: "subscribe BTCUSDT",
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = ClientMessage::parse(test.input).map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_subscription_request_validate() {
        struct TestCase {
            input: SubscriptionRequest,
            expected: Result<Vec<AggregatorKey>, ValidationError>,
        }

        let defaults = [Timeframe::M1, Timeframe::H1];
        let key = |symbol: &str, timeframe| AggregatorKey::new(SmolStr::new(symbol), timeframe);

        let tests = vec![
            TestCase {
                // TC0: explicit timeframes produce every pair in request order
                input: SubscriptionRequest {
                    symbols: vec!["btcusdt".to_string(), "ETHUSDT".to_string()],
                    timeframes: vec!["5m".to_string(), "1m".to_string()],
                    indicators: None,
                },
                expected: Ok(vec![
                    key("BTCUSDT", Timeframe::M5),
                    key("BTCUSDT", Timeframe::M1),
                    key("ETHUSDT", Timeframe::M5),
                    key("ETHUSDT", Timeframe::M1),
                ]),
            },
            TestCase {
                // TC1: no timeframes falls back to defaults
                input: SubscriptionRequest {
                    symbols: vec!["SPY".to_string()],
                    timeframes: vec![],
                    indicators: None,
                },
                expected: Ok(vec![key("SPY", Timeframe::M1), key("SPY", Timeframe::H1)]),
            },
            TestCase {
                // TC2: duplicates collapse
                input: SubscriptionRequest {
                    symbols: vec!["spy".to_string(), "SPY".to_string()],
                    timeframes: vec!["60s".to_string(), "1m".to_string()],
                    indicators: None,
                },
                expected: Ok(vec![key("SPY", Timeframe::M1)]),
            },
            TestCase {
                // TC3: no symbols
                input: SubscriptionRequest::default(),
                expected: Err(ValidationError::EmptySubscription),
            },
            TestCase {
                // TC4: invalid timeframe
                input: SubscriptionRequest {
                    symbols: vec!["SPY".to_string()],
                    timeframes: vec!["1x".to_string()],
                    indicators: None,
                },
                expected: Err(ValidationError::Timeframe("1x".to_string())),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test
                .input
                .validate()
                .map(|subscription| subscription.keys(&defaults).into_iter().collect::<Vec<_>>());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_subscription_matches() {
        let subscription = SubscriptionRequest {
            symbols: vec!["SPY".to_string()],
            timeframes: vec![],
            indicators: None,
        }
        .validate()
        .unwrap();

        assert!(subscription.matches(&AggregatorKey::new(SmolStr::new("SPY"), Timeframe::D1)));
        assert!(!subscription.matches(&AggregatorKey::new(SmolStr::new("QQQ"), Timeframe::D1)));
    }

    #[test]
    fn test_server_message_candle_wire_format() {
        let candle = Candle {
            symbol: SmolStr::new("BTCUSDT"),
            timeframe: Timeframe::M1,
            bucket_start: Utc.timestamp_opt(60, 0).unwrap(),
            open: 100.0,
            high: 101.0,
            low: 99.5,
            close: 100.5,
            volume: 2.0,
            vwap: 100.25,
            tick_count: 2,
            is_complete: false,
        };

        let actual: serde_json::Value =
            serde_json::from_str(&ServerMessage::Candle(CandleMessage::from(&candle)).to_payload())
                .unwrap();

        let expected = serde_json::json!({
            "type": "candle",
            "symbol": "BTCUSDT",
            "timeframe": "1m",
            "bucketStart": 60,
            "open": 100.0,
            "high": 101.0,
            "low": 99.5,
            "close": 100.5,
            "volume": 2.0,
            "vwap": 100.25,
            "tickCount": 2,
            "isComplete": false
        });

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_server_message_control_wire_format() {
        struct TestCase {
            input: ServerMessage,
            expected: serde_json::Value,
        }

        let tests = vec![
            TestCase {
                // TC0: welcome
                input: ServerMessage::Welcome {
                    connection_id: ConnectionId(4),
                },
                expected: serde_json::json!({"type": "welcome", "connectionId": 4}),
            },
            TestCase {
                // TC1: heartbeat in epoch millis
                input: ServerMessage::heartbeat(Utc.timestamp_opt(1, 500_000_000).unwrap()),
                expected: serde_json::json!({"type": "heartbeat", "ts": 1500}),
            },
            TestCase {
                // TC2: error carries the engine error code
                input: ServerMessage::from(&EngineError::Capacity { max: 2 }),
                expected: serde_json::json!({
                    "type": "error",
                    "code": "CAPACITY_ERROR",
                    "message": "connection capacity reached: 2 connections already open"
                }),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual: serde_json::Value =
                serde_json::from_str(&test.input.to_payload()).unwrap();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
