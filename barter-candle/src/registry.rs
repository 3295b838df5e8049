//! Registry of live [`CandleAggregator`]s keyed by (symbol, timeframe).
//!
//! The key map is read-mostly: tick routing only takes the read lock long enough to clone the
//! per-key slot handles, while creating or tearing down an aggregator takes the write lock.
//! Each slot serialises `ingest` + event delivery behind its own mutex, so different keys run in
//! parallel and events for one key are delivered in ingestion order.

use crate::{
    aggregator::{AggregatorStats, CandleAggregator},
    candle::{AggregatorKey, Candle, CandleEvent},
    config::EngineConfig,
    error::EngineError,
    tick::{Tick, parse_symbol},
    timeframe::Timeframe,
};
use chrono::TimeDelta;
use derive_more::{Display, From};
use fnv::FnvHashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identifies one subscriber registration in the [`AggregatorRegistry`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct SubscriberId(pub u64);

/// Receiver of [`CandleEvent`]s for the keys it is registered under.
///
/// Invoked synchronously on the tick-processing path while the key's aggregator is locked, so
/// implementations must not block and must not call back into the [`AggregatorRegistry`].
pub trait CandleSink: Send + Sync {
    fn on_candle_event(&self, event: &CandleEvent);
}

impl<F> CandleSink for F
where
    F: Fn(&CandleEvent) + Send + Sync,
{
    fn on_candle_event(&self, event: &CandleEvent) {
        self(event)
    }
}

/// [`CandleSink`] publishing every event onto an unbounded Tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub mpsc::UnboundedSender<CandleEvent>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CandleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl CandleSink for ChannelSink {
    fn on_candle_event(&self, event: &CandleEvent) {
        // Receiver gone means the consumer is shutting down, nothing to deliver to
        let _ = self.0.send(event.clone());
    }
}

/// Aggregate view across every registered key.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct RegistryStats {
    pub symbols: usize,
    pub aggregators: usize,
    pub subscriptions: usize,
    pub ticks_accepted: u64,
    pub ticks_rejected: u64,
    pub candles_completed: u64,
}

struct SinkEntry {
    sink: Arc<dyn CandleSink>,
    subscribers: Vec<SubscriberId>,
}

struct AggregatorSlot {
    aggregator: Mutex<CandleAggregator>,
    // Ordered by first registration of each distinct sink
    sinks: RwLock<Vec<SinkEntry>>,
}

impl AggregatorSlot {
    fn new(aggregator: CandleAggregator) -> Self {
        Self {
            aggregator: Mutex::new(aggregator),
            sinks: RwLock::new(Vec::new()),
        }
    }

    fn register(&self, subscriber: SubscriberId, sink: &Arc<dyn CandleSink>) {
        let mut sinks = self.sinks.write();

        if sinks
            .iter()
            .any(|entry| entry.subscribers.contains(&subscriber))
        {
            return;
        }

        match sinks
            .iter_mut()
            .find(|entry| Arc::ptr_eq(&entry.sink, sink))
        {
            Some(entry) => entry.subscribers.push(subscriber),
            None => sinks.push(SinkEntry {
                sink: Arc::clone(sink),
                subscribers: vec![subscriber],
            }),
        }
    }

    /// Remove a subscriber, returning `true` if it was registered.
    fn deregister(&self, subscriber: SubscriberId) -> bool {
        let mut sinks = self.sinks.write();

        let Some(index) = sinks
            .iter()
            .position(|entry| entry.subscribers.contains(&subscriber))
        else {
            return false;
        };

        let entry = &mut sinks[index];
        entry.subscribers.retain(|id| *id != subscriber);
        if entry.subscribers.is_empty() {
            sinks.remove(index);
        }
        true
    }

    fn subscriber_count(&self) -> usize {
        self.sinks
            .read()
            .iter()
            .map(|entry| entry.subscribers.len())
            .sum()
    }

    fn ingest(&self, tick: &Tick) -> bool {
        let mut aggregator = self.aggregator.lock();
        let Some(event) = aggregator.ingest(tick) else {
            return false;
        };

        // Delivered under the aggregator lock to keep per-key ordering
        for entry in self.sinks.read().iter() {
            entry.sink.on_candle_event(&event);
        }
        true
    }
}

/// Owns every [`CandleAggregator`], routes ticks to them and delivers their events.
pub struct AggregatorRegistry {
    history_capacity: usize,
    tolerance: TimeDelta,
    symbols: RwLock<FnvHashMap<SmolStr, IndexMap<Timeframe, Arc<AggregatorSlot>>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for AggregatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorRegistry")
            .field("history_capacity", &self.history_capacity)
            .field("tolerance", &self.tolerance)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AggregatorRegistry {
    pub fn new(history_capacity: usize, tolerance: TimeDelta) -> Self {
        Self {
            history_capacity,
            tolerance,
            symbols: RwLock::new(FnvHashMap::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.tick_buffer_size, config.tolerance())
    }

    /// Register `sink` for every (symbol, timeframe) pair, creating any missing aggregators.
    ///
    /// Registering a subscriber that is already present on a key is a no-op for that key.
    pub fn subscribe(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
        subscriber: SubscriberId,
        sink: Arc<dyn CandleSink>,
    ) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        let symbol = parse_symbol(symbol)?;

        for timeframe in timeframes {
            // Fast path: key exists, the read lock keeps teardown out while registering
            {
                let symbols = self.symbols.read();
                if let Some(slot) = symbols.get(&symbol).and_then(|slots| slots.get(timeframe)) {
                    slot.register(subscriber, &sink);
                    continue;
                }
            }

            let mut symbols = self.symbols.write();
            let slot = symbols
                .entry(symbol.clone())
                .or_default()
                .entry(*timeframe)
                .or_insert_with(|| {
                    let key = AggregatorKey::new(symbol.clone(), *timeframe);
                    info!(%key, "created candle aggregator");
                    Arc::new(AggregatorSlot::new(CandleAggregator::new(
                        key,
                        self.history_capacity,
                        self.tolerance,
                    )))
                });
            slot.register(subscriber, &sink);
        }

        debug!(%symbol, ?timeframes, %subscriber, "registered candle subscriber");
        Ok(())
    }

    /// Remove `subscriber` from the given keys, tearing down aggregators left without
    /// subscribers. Returns the number of registrations removed.
    pub fn unsubscribe(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
        subscriber: SubscriberId,
    ) -> Result<usize, EngineError> {
        let symbol = parse_symbol(symbol)?;

        let mut removed = 0;
        let mut emptied = Vec::new();
        {
            let symbols = self.symbols.read();
            let Some(slots) = symbols.get(&symbol) else {
                return Ok(0);
            };

            for timeframe in timeframes {
                let Some(slot) = slots.get(timeframe) else {
                    continue;
                };
                if slot.deregister(subscriber) {
                    removed += 1;
                    if slot.subscriber_count() == 0 {
                        emptied.push(AggregatorKey::new(symbol.clone(), *timeframe));
                    }
                }
            }
        }

        self.teardown(emptied);
        Ok(removed)
    }

    /// Remove every registration held by `subscriber`. Returns the number removed.
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) -> usize {
        let mut removed = 0;
        let mut emptied = Vec::new();
        {
            let symbols = self.symbols.read();
            for (symbol, slots) in symbols.iter() {
                for (timeframe, slot) in slots.iter() {
                    if slot.deregister(subscriber) {
                        removed += 1;
                        if slot.subscriber_count() == 0 {
                            emptied.push(AggregatorKey::new(symbol.clone(), *timeframe));
                        }
                    }
                }
            }
        }

        self.teardown(emptied);
        removed
    }

    /// Ingest a [`Tick`] into every aggregator registered for its symbol, delivering each
    /// resulting event to that key's sinks before returning. Returns the number of events.
    pub fn process_tick(&self, tick: &Tick) -> usize {
        let slots = {
            let symbols = self.symbols.read();
            match symbols.get(tick.symbol()) {
                Some(slots) => slots.values().cloned().collect::<Vec<_>>(),
                None => return 0,
            }
        };

        slots.iter().filter(|slot| slot.ingest(tick)).count()
    }

    pub fn contains(&self, key: &AggregatorKey) -> bool {
        self.slot(key).is_some()
    }

    pub fn subscriber_count(&self, key: &AggregatorKey) -> usize {
        self.slot(key).map_or(0, |slot| slot.subscriber_count())
    }

    pub fn current_candle(&self, key: &AggregatorKey) -> Option<Candle> {
        self.slot(key)
            .and_then(|slot| slot.aggregator.lock().current_candle())
    }

    pub fn history(&self, key: &AggregatorKey) -> Vec<Candle> {
        self.slot(key)
            .map(|slot| slot.aggregator.lock().history())
            .unwrap_or_default()
    }

    pub fn aggregator_stats(&self, key: &AggregatorKey) -> Option<AggregatorStats> {
        self.slot(key).map(|slot| slot.aggregator.lock().stats())
    }

    /// Every registered key, grouped by symbol in no particular order.
    pub fn keys(&self) -> Vec<AggregatorKey> {
        self.symbols
            .read()
            .iter()
            .flat_map(|(symbol, slots)| {
                slots
                    .keys()
                    .map(|timeframe| AggregatorKey::new(symbol.clone(), *timeframe))
            })
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let symbols = self.symbols.read();

        symbols.values().flat_map(IndexMap::values).fold(
            RegistryStats {
                symbols: symbols.len(),
                ..RegistryStats::default()
            },
            |mut stats, slot| {
                let aggregator = slot.aggregator.lock().stats();
                stats.aggregators += 1;
                stats.subscriptions += slot.subscriber_count();
                stats.ticks_accepted += aggregator.ticks_accepted;
                stats.ticks_rejected += aggregator.ticks_rejected;
                stats.candles_completed += aggregator.candles_completed;
                stats
            },
        )
    }

    /// Drop every aggregator and refuse further subscriptions.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut symbols = self.symbols.write();
        let aggregators: usize = symbols.values().map(IndexMap::len).sum();
        symbols.clear();
        info!(aggregators, "candle aggregator registry shut down");
    }

    fn slot(&self, key: &AggregatorKey) -> Option<Arc<AggregatorSlot>> {
        self.symbols
            .read()
            .get(&key.symbol)
            .and_then(|slots| slots.get(&key.timeframe))
            .cloned()
    }

    fn teardown(&self, keys: Vec<AggregatorKey>) {
        if keys.is_empty() {
            return;
        }

        let mut symbols = self.symbols.write();
        for key in keys {
            let Some(slots) = symbols.get_mut(&key.symbol) else {
                continue;
            };

            // A concurrent subscribe may have re-used the slot since it emptied
            let still_empty = slots
                .get(&key.timeframe)
                .is_some_and(|slot| slot.subscriber_count() == 0);
            if !still_empty {
                continue;
            }

            slots.shift_remove(&key.timeframe);
            if slots.is_empty() {
                symbols.remove(&key.symbol);
            }
            info!(%key, "tore down candle aggregator with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::CandleEventKind;
    use chrono::{DateTime, Utc};

    fn registry() -> AggregatorRegistry {
        AggregatorRegistry::new(10, TimeDelta::seconds(5))
    }

    fn tick(symbol: &str, secs: i64, price: f64) -> Tick {
        Tick::new(symbol, price, 1.0, time(secs)).unwrap()
    }

    fn time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn key(symbol: &str, timeframe: Timeframe) -> AggregatorKey {
        AggregatorKey::new(SmolStr::new(symbol), timeframe)
    }

    fn recording_sink(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn CandleSink> {
        let log = Arc::clone(log);
        Arc::new(move |event: &CandleEvent| {
            log.lock()
                .push(format!("{label}:{}:{}", event.key(), event.kind));
        })
    }

    #[test]
    fn test_subscribe_creates_aggregators_lazily() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new();

        registry
            .subscribe("x", &[Timeframe::M1, Timeframe::M5], SubscriberId(1), Arc::new(sink))
            .unwrap();

        assert!(registry.contains(&key("X", Timeframe::M1)));
        assert!(registry.contains(&key("X", Timeframe::M5)));
        assert!(!registry.contains(&key("X", Timeframe::H1)));
        assert_eq!(registry.stats().aggregators, 2);
        assert_eq!(registry.stats().symbols, 1);
    }

    #[test]
    fn test_subscribe_rejects_invalid_symbol() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new();

        let result = registry.subscribe("", &[Timeframe::M1], SubscriberId(1), Arc::new(sink));
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(registry.stats().aggregators, 0);
    }

    #[test]
    fn test_process_tick_routes_to_every_timeframe_of_symbol() {
        let registry = registry();
        let (sink_1m, mut rx_1m) = ChannelSink::new();
        let (sink_5m, mut rx_5m) = ChannelSink::new();

        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), Arc::new(sink_1m))
            .unwrap();
        registry
            .subscribe("X", &[Timeframe::M5], SubscriberId(2), Arc::new(sink_5m))
            .unwrap();

        assert_eq!(registry.process_tick(&tick("X", 0, 100.0)), 2);
        assert_eq!(registry.process_tick(&tick("Y", 0, 100.0)), 0);

        assert_eq!(rx_1m.try_recv().unwrap().key(), key("X", Timeframe::M1));
        assert_eq!(rx_5m.try_recv().unwrap().key(), key("X", Timeframe::M5));
        assert!(rx_1m.try_recv().is_err());
    }

    #[test]
    fn test_delivery_preserves_registration_and_ingestion_order() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), recording_sink("a", &log))
            .unwrap();
        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(2), recording_sink("b", &log))
            .unwrap();

        registry.process_tick(&tick("X", 0, 100.0));
        registry.process_tick(&tick("X", 61, 101.0));

        assert_eq!(
            *log.lock(),
            vec![
                "a:X@1m:partial",
                "b:X@1m:partial",
                "a:X@1m:completed",
                "b:X@1m:completed",
            ]
        );
    }

    #[test]
    fn test_shared_sink_receives_each_event_once() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = recording_sink("shared", &log);

        for subscriber in 1..=3 {
            registry
                .subscribe("X", &[Timeframe::M1], SubscriberId(subscriber), Arc::clone(&sink))
                .unwrap();
        }
        assert_eq!(registry.subscriber_count(&key("X", Timeframe::M1)), 3);

        registry.process_tick(&tick("X", 0, 100.0));
        assert_eq!(log.lock().len(), 1);

        // Sink stays registered while any of its subscribers remain
        registry
            .unsubscribe("X", &[Timeframe::M1], SubscriberId(1))
            .unwrap();
        registry.process_tick(&tick("X", 1, 100.0));
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery_and_tears_down_at_zero() {
        let registry = registry();
        let (sink_a, mut rx_a) = ChannelSink::new();
        let (sink_b, mut rx_b) = ChannelSink::new();
        let key_1m = key("X", Timeframe::M1);

        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), Arc::new(sink_a))
            .unwrap();
        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(2), Arc::new(sink_b))
            .unwrap();
        registry.process_tick(&tick("X", 0, 100.0));

        assert_eq!(
            registry
                .unsubscribe("X", &[Timeframe::M1], SubscriberId(1))
                .unwrap(),
            1
        );
        assert!(registry.contains(&key_1m));

        registry.process_tick(&tick("X", 1, 101.0));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().kind, CandleEventKind::Partial);
        assert_eq!(rx_b.try_recv().unwrap().candle.close, 101.0);

        registry
            .unsubscribe("X", &[Timeframe::M1], SubscriberId(2))
            .unwrap();
        assert!(!registry.contains(&key_1m));
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn test_resubscribe_after_teardown_discards_partial_candle() {
        let registry = registry();
        let key_1m = key("X", Timeframe::M1);
        let (sink, _rx) = ChannelSink::new();
        let sink: Arc<dyn CandleSink> = Arc::new(sink);

        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), Arc::clone(&sink))
            .unwrap();
        registry.process_tick(&tick("X", 0, 100.0));
        assert!(registry.current_candle(&key_1m).is_some());

        registry.unsubscribe_all(SubscriberId(1));
        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), sink)
            .unwrap();

        assert_eq!(registry.current_candle(&key_1m), None);
        assert_eq!(registry.aggregator_stats(&key_1m), Some(AggregatorStats::default()));
    }

    #[test]
    fn test_unsubscribe_all_removes_every_registration() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new();
        let sink: Arc<dyn CandleSink> = Arc::new(sink);

        registry
            .subscribe("X", &[Timeframe::M1, Timeframe::M5], SubscriberId(1), Arc::clone(&sink))
            .unwrap();
        registry
            .subscribe("Y", &[Timeframe::M1], SubscriberId(1), Arc::clone(&sink))
            .unwrap();
        registry
            .subscribe("Y", &[Timeframe::M1], SubscriberId(2), sink)
            .unwrap();

        assert_eq!(registry.unsubscribe_all(SubscriberId(1)), 3);
        assert_eq!(registry.keys(), vec![key("Y", Timeframe::M1)]);
        assert_eq!(registry.stats().subscriptions, 1);
    }

    #[test]
    fn test_subscribe_is_idempotent_per_subscriber() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new();
        let sink: Arc<dyn CandleSink> = Arc::new(sink);

        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), Arc::clone(&sink))
            .unwrap();
        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), sink)
            .unwrap();

        assert_eq!(registry.subscriber_count(&key("X", Timeframe::M1)), 1);
    }

    #[test]
    fn test_history_and_stats_reflect_completed_candles() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new();
        let key_1m = key("X", Timeframe::M1);

        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), Arc::new(sink))
            .unwrap();
        registry.process_tick(&tick("X", 100, 100.0));
        registry.process_tick(&tick("X", 10, 90.0));
        registry.process_tick(&tick("X", 130, 101.0));

        let history = registry.history(&key_1m);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].bucket_start, time(60));

        let stats = registry.stats();
        assert_eq!(stats.ticks_accepted, 2);
        assert_eq!(stats.ticks_rejected, 1);
        assert_eq!(stats.candles_completed, 1);
    }

    #[test]
    fn test_shutdown_refuses_new_subscriptions() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new();
        let sink: Arc<dyn CandleSink> = Arc::new(sink);

        registry
            .subscribe("X", &[Timeframe::M1], SubscriberId(1), Arc::clone(&sink))
            .unwrap();
        registry.shutdown();

        assert!(registry.keys().is_empty());
        assert_eq!(
            registry.subscribe("X", &[Timeframe::M1], SubscriberId(1), sink),
            Err(EngineError::ShutDown)
        );
    }

    #[test]
    fn test_concurrent_ingestion_across_keys() {
        let registry = Arc::new(registry());
        let (sink, mut rx) = ChannelSink::new();
        let sink: Arc<dyn CandleSink> = Arc::new(sink);

        for symbol in ["A", "B", "C", "D"] {
            registry
                .subscribe(symbol, &[Timeframe::S1], SubscriberId(1), Arc::clone(&sink))
                .unwrap();
        }

        let handles = ["A", "B", "C", "D"]
            .into_iter()
            .map(|symbol| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for secs in 0..100 {
                        registry.process_tick(&tick(symbol, secs, 100.0 + secs as f64));
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut last_bucket = FnvHashMap::<SmolStr, DateTime<Utc>>::default();
        let mut events = 0;
        while let Ok(event) = rx.try_recv() {
            // Per-key ordering: buckets for a symbol never go backwards
            let bucket = event.candle.bucket_start;
            if let Some(previous) = last_bucket.insert(event.candle.symbol.clone(), bucket) {
                assert!(bucket >= previous);
            }
            events += 1;
        }

        assert_eq!(events, 400);
        assert_eq!(registry.stats().candles_completed, 4 * 99);
    }
}
