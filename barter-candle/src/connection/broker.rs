use crate::{
    broadcast::Broadcaster,
    candle::AggregatorKey,
    config::EngineConfig,
    connection::{Connection, ConnectionId, ConnectionState, ConnectionTable},
    error::EngineError,
    message::{ClientMessage, ServerMessage},
    registry::{AggregatorRegistry, CandleSink, SubscriberId},
    timeframe::Timeframe,
};
use chrono::Utc;
use fnv::FnvHashMap;
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Aggregate view across every open connection.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub connecting: usize,
    pub active: usize,
    pub draining: usize,
    pub subscriptions: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub queue_depth: usize,
}

/// Keys added and removed by an [`ConnectionBroker::update_subscription`].
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct SubscriptionDelta {
    pub added: Vec<AggregatorKey>,
    pub removed: Vec<AggregatorKey>,
}

/// Owns the connection table and every connection's lifecycle, keeping registry subscriptions
/// and [`Broadcaster`] interest in step with each connection's interest set.
#[derive(Debug)]
pub struct ConnectionBroker {
    max_connections: usize,
    queue_capacity: usize,
    drain_on_disconnect: bool,
    default_timeframes: Vec<Timeframe>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    registry: Arc<AggregatorRegistry>,
    broadcaster: Arc<Broadcaster>,
    connections: Arc<ConnectionTable>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionBroker {
    pub fn new(
        config: &EngineConfig,
        registry: Arc<AggregatorRegistry>,
        broadcaster: Arc<Broadcaster>,
        connections: Arc<ConnectionTable>,
    ) -> Self {
        Self {
            max_connections: config.max_connections,
            queue_capacity: config.outbound_queue_capacity,
            drain_on_disconnect: config.drain_on_disconnect,
            default_timeframes: config.default_timeframes.clone(),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            registry,
            broadcaster,
            connections,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit a new connection in the [`ConnectionState::Connecting`] state.
    ///
    /// Connecting connections count towards `max_connections` so concurrent handshakes cannot
    /// overshoot the ceiling.
    pub fn connect(&self) -> Result<Arc<Connection>, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }

        let mut connections = self.connections.write();
        if connections.len() >= self.max_connections {
            warn!(
                open = connections.len(),
                max = self.max_connections,
                "rejected connection at capacity"
            );
            return Err(EngineError::Capacity {
                max: self.max_connections,
            });
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(Connection::new(id, self.queue_capacity));
        connections.insert(id, Arc::clone(&connection));

        info!(connection = %id, open = connections.len(), "connection admitted");
        Ok(connection)
    }

    /// Complete the handshake of a connecting connection and greet it.
    pub fn activate(&self, id: ConnectionId) -> Result<(), EngineError> {
        let connection = self.connection(id)?;
        connection.transition(ConnectionState::Active)?;
        connection.acknowledge(Instant::now());

        Broadcaster::push_control(&connection, &ServerMessage::Welcome { connection_id: id })?;
        info!(connection = %id, "connection active");
        Ok(())
    }

    /// Graceful disconnect. Subscriptions are released before returning; the connection drains
    /// its queue first if configured to and messages are pending.
    pub fn disconnect(&self, id: ConnectionId) -> Result<ConnectionState, EngineError> {
        let connection = self.connection(id)?;
        let released = self.release(&connection);

        let state = connection.state();
        let next = match state {
            ConnectionState::Active
                if self.drain_on_disconnect && !connection.queue().is_empty() =>
            {
                ConnectionState::Draining
            }
            ConnectionState::Draining | ConnectionState::Closed => return Ok(state),
            _ => ConnectionState::Closed,
        };

        if next == ConnectionState::Draining {
            connection.transition(ConnectionState::Draining)?;
            connection.queue().begin_drain();
            info!(
                connection = %id,
                released,
                pending = connection.queue().len(),
                "connection draining"
            );
        } else {
            self.close(&connection)?;
            info!(connection = %id, released, "connection closed");
        }

        Ok(next)
    }

    /// Close a connection immediately, discarding anything still queued.
    pub fn force_disconnect(&self, id: ConnectionId, reason: &str) -> Result<(), EngineError> {
        let connection = self.connection(id)?;
        let released = self.release(&connection);
        self.close(&connection)?;

        warn!(connection = %id, released, %reason, "connection force closed");
        Ok(())
    }

    /// Close a draining connection once its sender has flushed the backlog.
    pub fn finish_drain(&self, id: ConnectionId) -> Result<(), EngineError> {
        let Ok(connection) = self.connection(id) else {
            // Already closed and removed
            return Ok(());
        };

        match connection.state() {
            ConnectionState::Draining => {
                self.close(&connection)?;
                info!(connection = %id, "connection drained and closed");
                Ok(())
            }
            ConnectionState::Closed => Ok(()),
            from => Err(EngineError::InvalidTransition {
                connection: id,
                from,
                to: ConnectionState::Closed,
            }),
        }
    }

    /// Replace a connection's interest set with `desired`.
    ///
    /// Registry subscriptions are changed first; the stored interest set and broadcaster index
    /// only change once every registry call has succeeded. Added registrations are rolled back if
    /// a later one fails.
    pub fn update_subscription(
        &self,
        id: ConnectionId,
        desired: IndexSet<AggregatorKey>,
        indicators: Option<Vec<SmolStr>>,
    ) -> Result<SubscriptionDelta, EngineError> {
        self.modify_subscription(id, |_| desired, indicators)
    }

    /// As [`Self::update_subscription`], deriving the desired set from the current one while the
    /// connection's interest lock is held.
    fn modify_subscription<F>(
        &self,
        id: ConnectionId,
        desired: F,
        indicators: Option<Vec<SmolStr>>,
    ) -> Result<SubscriptionDelta, EngineError>
    where
        F: FnOnce(&IndexSet<AggregatorKey>) -> IndexSet<AggregatorKey>,
    {
        let connection = self.connection(id)?;
        let subscriber = connection.subscriber_id();

        // Held throughout so concurrent updates to one connection serialise
        let mut interest = connection.interest_mut();

        let state = connection.state();
        if state != ConnectionState::Active {
            return Err(EngineError::NotActive {
                connection: id,
                state,
            });
        }

        let desired = desired(&interest.keys);
        let added = desired
            .difference(&interest.keys)
            .cloned()
            .collect::<Vec<_>>();
        let removed = interest
            .keys
            .difference(&desired)
            .cloned()
            .collect::<Vec<_>>();

        let sink: Arc<dyn CandleSink> = self.broadcaster.clone();
        let mut subscribed: Vec<(SmolStr, Vec<Timeframe>)> = Vec::new();
        for (symbol, timeframes) in group_by_symbol(&added) {
            if let Err(error) = self
                .registry
                .subscribe(&symbol, &timeframes, subscriber, Arc::clone(&sink))
            {
                self.rollback(id, subscribed);
                warn!(connection = %id, %error, "subscription update failed, rolled back");
                return Err(error);
            }
            subscribed.push((symbol, timeframes));
        }

        for (symbol, timeframes) in group_by_symbol(&removed) {
            if let Err(error) = self.registry.unsubscribe(&symbol, &timeframes, subscriber) {
                self.rollback(id, subscribed);
                warn!(connection = %id, %error, "unsubscribe failed, additions rolled back");
                return Err(error);
            }
        }

        self.broadcaster.add_interest(&connection, &added);
        self.broadcaster.remove_interest(id, &removed);

        interest.keys = desired;
        if let Some(indicators) = indicators {
            interest.indicators = indicators;
        }

        debug!(
            connection = %id,
            added = added.len(),
            removed = removed.len(),
            total = interest.keys.len(),
            "subscription updated"
        );
        Ok(SubscriptionDelta { added, removed })
    }

    /// Apply a parsed client request, enqueuing any replies onto the connection.
    pub fn apply_control(&self, id: ConnectionId, message: ClientMessage) -> Result<(), EngineError> {
        match message {
            ClientMessage::Subscribe(request) => {
                let mut subscription = request.validate()?;
                let indicators = subscription.indicators.take();
                let requested = subscription.keys(&self.default_timeframes);

                let delta = self.modify_subscription(
                    id,
                    |current| current.union(&requested).cloned().collect(),
                    indicators,
                )?;
                self.send_subscribed(id)?;

                for key in delta.added {
                    let history = self.registry.history(&key);
                    if !history.is_empty() {
                        self.broadcaster
                            .send_control(id, &ServerMessage::history(&key, &history))?;
                    }
                }
                Ok(())
            }
            ClientMessage::Unsubscribe(request) => {
                let mut subscription = request.validate()?;
                let indicators = subscription.indicators.take();

                self.modify_subscription(
                    id,
                    |current| {
                        current
                            .iter()
                            .filter(|key| !subscription.matches(key))
                            .cloned()
                            .collect()
                    },
                    indicators,
                )?;
                self.send_subscribed(id)
            }
            ClientMessage::Heartbeat => self.acknowledge_heartbeat(id),
            ClientMessage::Stats => {
                let connection = self.connection(id)?;
                self.broadcaster.send_control(
                    id,
                    &ServerMessage::Stats {
                        connection: connection.stats(),
                        broker: self.stats(),
                        registry: self.registry.stats(),
                    },
                )
            }
        }
    }

    pub fn acknowledge_heartbeat(&self, id: ConnectionId) -> Result<(), EngineError> {
        self.connection(id)?.acknowledge(Instant::now());
        Ok(())
    }

    /// Force close active and draining connections silent for longer than the heartbeat
    /// timeout, and send a heartbeat to the remaining active ones. Returns the connections that
    /// were closed.
    ///
    /// Draining connections get no further acknowledgements, so a drain stalled on its
    /// transport is closed within one timeout of the last ack.
    pub fn check_heartbeats(&self, now: Instant) -> Vec<ConnectionId> {
        let open = self
            .connections
            .read()
            .values()
            .filter(|connection| {
                matches!(
                    connection.state(),
                    ConnectionState::Active | ConnectionState::Draining
                )
            })
            .cloned()
            .collect::<Vec<_>>();

        let heartbeat = ServerMessage::heartbeat(Utc::now());
        let (expired, alive): (Vec<_>, Vec<_>) = open.into_iter().partition(|connection| {
            now.saturating_duration_since(connection.last_ack()) > self.heartbeat_timeout
        });

        for connection in alive
            .iter()
            .filter(|connection| connection.state() == ConnectionState::Active)
        {
            // Rejection means it closed since the snapshot
            let _ = Broadcaster::push_control(connection, &heartbeat);
        }

        expired
            .into_iter()
            .filter_map(|connection| {
                self.force_disconnect(connection.id(), "heartbeat timeout")
                    .ok()
                    .map(|_| connection.id())
            })
            .collect()
    }

    /// Run [`Self::check_heartbeats`] every `heartbeat_interval` until shutdown.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(broker.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                if broker.closed.load(Ordering::Acquire) {
                    break;
                }

                let expired = broker.check_heartbeats(Instant::now());
                if !expired.is_empty() {
                    warn!(?expired, "closed connections after heartbeat timeout");
                }
            }
            debug!("heartbeat task stopped");
        })
    }

    pub fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>, EngineError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownConnection(id))
    }

    pub fn stats(&self) -> BrokerStats {
        self.connections
            .read()
            .values()
            .map(|connection| connection.stats())
            .fold(BrokerStats::default(), |mut stats, connection| {
                match connection.state {
                    ConnectionState::Connecting => stats.connecting += 1,
                    ConnectionState::Active => stats.active += 1,
                    ConnectionState::Draining => stats.draining += 1,
                    ConnectionState::Closed => {}
                }
                stats.subscriptions += connection.subscriptions;
                stats.messages_sent += connection.messages_sent;
                stats.messages_dropped += connection.messages_dropped;
                stats.queue_depth += connection.queue_depth;
                stats
            })
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every connection and refuse new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        let connections = self
            .connections
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for connection in &connections {
            self.release(connection);
            let _ = self.close(connection);
        }
        self.broadcaster.clear();

        info!(closed = connections.len(), "connection broker shut down");
    }

    fn send_subscribed(&self, id: ConnectionId) -> Result<(), EngineError> {
        let interest = self.connection(id)?.interest();
        self.broadcaster.send_control(
            id,
            &ServerMessage::Subscribed {
                subscriptions: interest.keys.into_iter().collect(),
                indicators: interest.indicators,
            },
        )
    }

    /// Undo registry subscriptions made by a failed update.
    fn rollback(&self, id: ConnectionId, subscribed: Vec<(SmolStr, Vec<Timeframe>)>) {
        let subscriber = SubscriberId::from(id);
        for (symbol, timeframes) in subscribed {
            if let Err(error) = self.registry.unsubscribe(&symbol, &timeframes, subscriber) {
                warn!(connection = %id, %symbol, %error, "failed to roll back subscription");
            }
        }
    }

    /// Remove every registry subscription and broadcaster interest of `connection`.
    fn release(&self, connection: &Arc<Connection>) -> usize {
        let mut interest = connection.interest_mut();
        self.broadcaster.remove_interest(connection.id(), &interest.keys);
        let released = self.registry.unsubscribe_all(connection.subscriber_id());
        interest.keys.clear();
        released
    }

    fn close(&self, connection: &Arc<Connection>) -> Result<(), EngineError> {
        let result = match connection.state() {
            ConnectionState::Closed => Ok(()),
            _ => connection.transition(ConnectionState::Closed).map(|_| ()),
        };
        connection.queue().close();
        self.connections.write().remove(&connection.id());
        result
    }
}

fn group_by_symbol(keys: &[AggregatorKey]) -> IndexMap<SmolStr, Vec<Timeframe>> {
    keys.iter()
        .map(|key| (key.symbol.clone(), key.timeframe))
        .into_group_map()
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .collect()
}

/// Connection table shared between a [`ConnectionBroker`] and its [`Broadcaster`].
pub fn connection_table() -> Arc<ConnectionTable> {
    Arc::new(RwLock::new(FnvHashMap::default()))
}
