use barter_candle::{config::EngineConfig, error::ConfigError, timeframe::Timeframe};
use std::{net::SocketAddr, str::FromStr, time::Duration};

const DEFAULT_WS_PORT: u16 = 9001;
const DEFAULT_TICK_PORT: u16 = 9002;

/// Server configuration loaded from environment variables.
///
/// | Variable                    | Default          |
/// |-----------------------------|------------------|
/// | `WS_ADDR`                   | `0.0.0.0:9001`   |
/// | `TICK_ADDR`                 | `0.0.0.0:9002`   |
/// | `MAX_CONNECTIONS`           | `1000`           |
/// | `TICK_BUFFER_SIZE`          | `500`            |
/// | `OUT_OF_ORDER_TOLERANCE_MS` | `2000`           |
/// | `DEFAULT_TIMEFRAMES`        | `1m,5m,15m,1h`   |
/// | `OUTBOUND_QUEUE_CAPACITY`   | `256`            |
/// | `HEARTBEAT_INTERVAL_MS`     | `30000`          |
/// | `HEARTBEAT_TIMEOUT_MS`      | `90000`          |
/// | `DRAIN_ON_DISCONNECT`       | `true`           |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub ws_addr: SocketAddr,
    pub tick_addr: SocketAddr,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup, validating the resulting [`EngineConfig`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = EngineConfig::default();
        let millis = |duration: Duration| duration.as_millis() as u64;

        let ws_addr = parse_or(
            var("WS_ADDR"),
            "WS_ADDR",
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT)),
        )?;
        let tick_addr = parse_or(
            var("TICK_ADDR"),
            "TICK_ADDR",
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_TICK_PORT)),
        )?;

        let heartbeat_interval = parse_or(
            var("HEARTBEAT_INTERVAL_MS"),
            "HEARTBEAT_INTERVAL_MS",
            millis(defaults.heartbeat_interval),
        )?;
        let heartbeat_timeout = parse_or(
            var("HEARTBEAT_TIMEOUT_MS"),
            "HEARTBEAT_TIMEOUT_MS",
            millis(defaults.heartbeat_timeout),
        )?;

        let mut engine = defaults
            .clone()
            .with_max_connections(parse_or(
                var("MAX_CONNECTIONS"),
                "MAX_CONNECTIONS",
                defaults.max_connections,
            )?)
            .with_tick_buffer_size(parse_or(
                var("TICK_BUFFER_SIZE"),
                "TICK_BUFFER_SIZE",
                defaults.tick_buffer_size,
            )?)
            .with_out_of_order_tolerance(Duration::from_millis(parse_or(
                var("OUT_OF_ORDER_TOLERANCE_MS"),
                "OUT_OF_ORDER_TOLERANCE_MS",
                millis(defaults.out_of_order_tolerance),
            )?))
            .with_outbound_queue_capacity(parse_or(
                var("OUTBOUND_QUEUE_CAPACITY"),
                "OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            )?)
            .with_heartbeat(
                Duration::from_millis(heartbeat_interval),
                Duration::from_millis(heartbeat_timeout),
            )
            .with_drain_on_disconnect(parse_or(
                var("DRAIN_ON_DISCONNECT"),
                "DRAIN_ON_DISCONNECT",
                defaults.drain_on_disconnect,
            )?);

        if let Some(timeframes) = var("DEFAULT_TIMEFRAMES") {
            let parsed = timeframes
                .split(',')
                .map(|timeframe| timeframe.trim().parse::<Timeframe>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ConfigError::Parse {
                    field: "DEFAULT_TIMEFRAMES",
                    value: timeframes.clone(),
                })?;
            engine = engine.with_default_timeframes(parsed);
        }

        engine.validate()?;

        Ok(Self {
            ws_addr,
            tick_addr,
            engine,
        })
    }
}

fn parse_or<T>(value: Option<String>, field: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match value {
        Some(value) => value.parse().map_err(|_| ConfigError::Parse { field, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_server_config_from_lookup() {
        struct TestCase {
            input: Vec<(&'static str, &'static str)>,
            expected: Result<ServerConfig, ConfigError>,
        }

        let tests = vec![
            TestCase {
                // TC0: no variables set uses defaults
                input: vec![],
                expected: Ok(ServerConfig {
                    ws_addr: "0.0.0.0:9001".parse().unwrap(),
                    tick_addr: "0.0.0.0:9002".parse().unwrap(),
                    engine: EngineConfig::default(),
                }),
            },
            TestCase {
                // TC1: overrides applied
                input: vec![
                    ("WS_ADDR", "127.0.0.1:8000"),
                    ("MAX_CONNECTIONS", "5"),
                    ("OUT_OF_ORDER_TOLERANCE_MS", "0"),
                    ("DEFAULT_TIMEFRAMES", "1m, 1d"),
                    ("DRAIN_ON_DISCONNECT", "false"),
                ],
                expected: Ok(ServerConfig {
                    ws_addr: "127.0.0.1:8000".parse().unwrap(),
                    tick_addr: "0.0.0.0:9002".parse().unwrap(),
                    engine: EngineConfig::default()
                        .with_max_connections(5)
                        .with_out_of_order_tolerance(Duration::ZERO)
                        .with_default_timeframes([Timeframe::M1, Timeframe::D1])
                        .with_drain_on_disconnect(false),
                }),
            },
            TestCase {
                // TC2: unparsable number
                input: vec![("TICK_BUFFER_SIZE", "lots")],
                expected: Err(ConfigError::Parse {
                    field: "TICK_BUFFER_SIZE",
                    value: "lots".to_string(),
                }),
            },
            TestCase {
                // TC3: invalid timeframe list
                input: vec![("DEFAULT_TIMEFRAMES", "1m,7x")],
                expected: Err(ConfigError::Parse {
                    field: "DEFAULT_TIMEFRAMES",
                    value: "1m,7x".to_string(),
                }),
            },
            TestCase {
                // TC4: parsed but invalid engine config
                input: vec![("MAX_CONNECTIONS", "0")],
                expected: Err(ConfigError::Zero {
                    field: "max_connections",
                }),
            },
            TestCase {
                // TC5: tolerance beyond the engine ceiling
                input: vec![("OUT_OF_ORDER_TOLERANCE_MS", "18446744073709551615")],
                expected: Err(ConfigError::ToleranceTooLarge {
                    tolerance_ms: u64::MAX,
                    max_ms: 86_400_000,
                }),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = ServerConfig::from_lookup(lookup(&test.input));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
