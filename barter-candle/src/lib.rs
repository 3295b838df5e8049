#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Barter-Candle
//! Real-time tick-to-candle aggregation with isolated, backpressured fan-out to many subscribers.
//!
//! Ticks are routed by symbol to one [`CandleAggregator`](aggregator::CandleAggregator) per
//! (symbol, timeframe). Every resulting [`CandleEvent`](candle::CandleEvent) is delivered
//! synchronously to the key's sinks, which for client connections is the shared
//! [`Broadcaster`](broadcast::Broadcaster): it serialises the candle once and pushes it onto the
//! bounded outbound queue of every interested connection, where each connection's sender task
//! drains it into its [`Transport`](connection::sender::Transport).
//!
//! ## Examples
//! ```rust,no_run
//! use barter_candle::{config::EngineConfig, engine::CandleEngine};
//!
//! let engine = CandleEngine::new(EngineConfig::default()).unwrap();
//! engine.ingest_tick("BTCUSDT", 65_000.0, 0.25, None).unwrap();
//! ```

/// [`CandleAggregator`](aggregator::CandleAggregator) maintaining the open bucket and bounded
/// history of one (symbol, timeframe).
pub mod aggregator;

/// Fan-out of candle events to the outbound queues of interested connections.
pub mod broadcast;

/// [`Candle`](candle::Candle), [`CandleEvent`](candle::CandleEvent) and
/// [`AggregatorKey`](candle::AggregatorKey).
pub mod candle;

/// Typed, validated [`EngineConfig`](config::EngineConfig).
pub mod config;

/// Connections, their state machine, outbound queues, broker and sender task.
pub mod connection;

/// [`CandleEngine`](engine::CandleEngine) façade owning initialisation and shutdown.
pub mod engine;

/// All [`Error`](std::error::Error)s generated in Barter-Candle.
pub mod error;

/// JSON wire protocol exchanged with clients.
pub mod message;

/// [`AggregatorRegistry`](registry::AggregatorRegistry) owning every aggregator and routing
/// ticks to them.
pub mod registry;

/// Validated [`Tick`](tick::Tick) input and symbol normalisation.
pub mod tick;

/// Candle bucket width and bucket-start arithmetic.
pub mod timeframe;

