use crate::{
    broadcast::Broadcaster,
    config::EngineConfig,
    connection::{
        Connection, ConnectionId, ConnectionState,
        broker::{BrokerStats, ConnectionBroker, connection_table},
        sender::{Transport, spawn_sender},
    },
    error::EngineError,
    message::ClientMessage,
    registry::{AggregatorRegistry, RegistryStats},
    tick::Tick,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Combined [`AggregatorRegistry`] and [`ConnectionBroker`] statistics.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct EngineStats {
    pub registry: RegistryStats,
    pub broker: BrokerStats,
}

/// Explicitly constructed engine wiring the [`AggregatorRegistry`], [`Broadcaster`] and
/// [`ConnectionBroker`] together.
///
/// Ticks enter through [`CandleEngine::ingest_tick`]. Clients are admitted with
/// [`CandleEngine::connect`], attached to their transport with [`CandleEngine::spawn_sender`] and
/// fed with [`CandleEngine::handle_client_message`].
#[derive(Debug, Clone)]
pub struct CandleEngine {
    config: Arc<EngineConfig>,
    registry: Arc<AggregatorRegistry>,
    broadcaster: Arc<Broadcaster>,
    broker: Arc<ConnectionBroker>,
}

impl CandleEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let registry = Arc::new(AggregatorRegistry::from_config(&config));
        let connections = connection_table();
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&connections)));
        let broker = Arc::new(ConnectionBroker::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            connections,
        ));

        info!(
            max_connections = config.max_connections,
            tick_buffer_size = config.tick_buffer_size,
            tolerance_ms = config.out_of_order_tolerance.as_millis() as u64,
            default_timeframes = ?config.default_timeframes,
            "candle engine initialised"
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            broadcaster,
            broker,
        })
    }

    /// Validate and route one tick, delivering every resulting candle event before returning.
    /// `timestamp` defaults to receipt time. Returns the number of events produced.
    pub fn ingest_tick(
        &self,
        symbol: &str,
        price: f64,
        size: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<usize, EngineError> {
        if self.broker.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        let tick = Tick::new(symbol, price, size, timestamp.unwrap_or_else(Utc::now))?;
        Ok(self.registry.process_tick(&tick))
    }

    /// Admit a connection and complete its handshake. Attach its transport with
    /// [`Self::spawn_sender`].
    pub fn connect(&self) -> Result<Arc<Connection>, EngineError> {
        let connection = self.broker.connect()?;
        if let Err(error) = self.broker.activate(connection.id()) {
            let _ = self.broker.force_disconnect(connection.id(), "handshake failed");
            return Err(error);
        }
        Ok(connection)
    }

    /// Drain `connection`'s outbound queue into `transport` on a dedicated task.
    pub fn spawn_sender<T>(&self, connection: &Arc<Connection>, transport: T) -> JoinHandle<()>
    where
        T: Transport + 'static,
    {
        spawn_sender(Arc::clone(&self.broker), Arc::clone(connection), transport)
    }

    pub fn disconnect(&self, id: ConnectionId) -> Result<ConnectionState, EngineError> {
        self.broker.disconnect(id)
    }

    /// Parse and apply one client text message. Failures are also reported to the client as an
    /// `error` message and never close the connection.
    pub fn handle_client_message(&self, id: ConnectionId, text: &str) -> Result<(), EngineError> {
        let result = ClientMessage::parse(text)
            .map_err(EngineError::from)
            .and_then(|message| self.broker.apply_control(id, message));

        if let Err(error) = &result {
            debug!(connection = %id, %error, "rejected client message");
            if !error.is_connection_fatal() {
                let _ = self.broadcaster.send_error(id, error);
            }
        }
        result
    }

    /// Acknowledge liveness of a connection (eg/ on a transport-level pong).
    pub fn acknowledge_heartbeat(&self, id: ConnectionId) -> Result<(), EngineError> {
        self.broker.acknowledge_heartbeat(id)
    }

    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        self.broker.spawn_heartbeat()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            registry: self.registry.stats(),
            broker: self.broker.stats(),
        }
    }

    /// Close every connection, drop every aggregator and refuse further work.
    pub fn shutdown(&self) {
        self.broker.shutdown();
        self.registry.shutdown();
        info!("candle engine shut down");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AggregatorRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ValidationError};

    #[test]
    fn test_new_rejects_invalid_config() {
        let actual = CandleEngine::new(EngineConfig::default().with_tick_buffer_size(0)).err();
        assert_eq!(
            actual,
            Some(EngineError::Config(ConfigError::Zero {
                field: "tick_buffer_size"
            }))
        );
    }

    #[test]
    fn test_ingest_tick_validation() {
        struct TestCase {
            symbol: &'static str,
            price: f64,
            size: f64,
            expected: Result<usize, EngineError>,
        }

        let engine = CandleEngine::new(EngineConfig::default()).unwrap();

        let tests = vec![
            TestCase {
                // TC0: valid tick with no subscribers produces no events
                symbol: "BTCUSDT",
                price: 100.0,
                size: 1.0,
                expected: Ok(0),
            },
            TestCase {
                // TC1: zero price
                symbol: "BTCUSDT",
                price: 0.0,
                size: 1.0,
                expected: Err(EngineError::Validation(ValidationError::Price("0".to_string()))),
            },
            TestCase {
                // TC2: negative size
                symbol: "BTCUSDT",
                price: 1.0,
                size: -1.0,
                expected: Err(EngineError::Validation(ValidationError::Size("-1".to_string()))),
            },
            TestCase {
                // TC3: empty symbol
                symbol: "",
                price: 1.0,
                size: 1.0,
                expected: Err(EngineError::Validation(ValidationError::Symbol(String::new()))),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = engine.ingest_tick(test.symbol, test.price, test.size, None);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_handle_client_message_reports_errors_to_client() {
        let engine = CandleEngine::new(EngineConfig::default()).unwrap();
        let connection = engine.connect().unwrap();
        connection.queue().try_recv();

        let actual = engine.handle_client_message(connection.id(), r#"{"action":"subscribe"}"#);
        assert_eq!(
            actual,
            Err(EngineError::Validation(ValidationError::EmptySubscription))
        );

        let reply: serde_json::Value =
            serde_json::from_str(&connection.queue().try_recv().unwrap().payload).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "VALIDATION_ERROR");
        assert_eq!(connection.state(), ConnectionState::Active);
    }

    #[test]
    fn test_shutdown_refuses_ticks() {
        let engine = CandleEngine::new(EngineConfig::default()).unwrap();
        engine.shutdown();

        assert_eq!(
            engine.ingest_tick("BTCUSDT", 1.0, 1.0, None),
            Err(EngineError::ShutDown)
        );
        assert_eq!(engine.stats(), EngineStats::default());
    }
}
