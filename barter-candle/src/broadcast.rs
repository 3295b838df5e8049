use crate::{
    candle::{AggregatorKey, CandleEvent},
    connection::{Connection, ConnectionId, ConnectionState, ConnectionTable, queue::Enqueued},
    error::EngineError,
    message::{CandleMessage, ServerMessage},
    registry::CandleSink,
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

/// Fans [`CandleEvent`]s out to the outbound queues of every interested connection.
///
/// Registered as the single shared [`CandleSink`] for every connection subscription, so the
/// registry delivers each event here once and the interest index resolves its recipients. An
/// event is serialised once and the payload shared between queues.
#[derive(Debug)]
pub struct Broadcaster {
    connections: Arc<ConnectionTable>,
    interest: RwLock<FnvHashMap<AggregatorKey, Vec<Arc<Connection>>>>,
}

impl Broadcaster {
    pub fn new(connections: Arc<ConnectionTable>) -> Self {
        Self {
            connections,
            interest: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Enqueue `event` onto every connection interested in its key. Returns the number of
    /// connections the event was queued for.
    pub fn on_candle_event(&self, event: &CandleEvent) -> usize {
        let key = event.key();
        let interest = self.interest.read();
        let Some(connections) = interest.get(&key) else {
            return 0;
        };

        let payload = ServerMessage::Candle(CandleMessage::from(&event.candle)).to_payload();

        let mut queued = 0;
        for connection in connections {
            if connection.state() != ConnectionState::Active {
                continue;
            }
            match connection.queue().push_data(Arc::clone(&payload)) {
                Enqueued::Queued => queued += 1,
                Enqueued::EvictedOldest => {
                    queued += 1;
                    trace!(connection = %connection.id(), %key, "evicted oldest candle from full queue");
                }
                Enqueued::Dropped => {
                    trace!(connection = %connection.id(), %key, "dropped candle, queue full of control messages");
                }
                Enqueued::Rejected => {}
            }
        }
        queued
    }

    /// Enqueue an error for one connection. Control class, never dropped.
    pub fn send_error(&self, id: ConnectionId, error: &EngineError) -> Result<(), EngineError> {
        debug!(connection = %id, code = error.code(), %error, "sending error to connection");
        self.send_control(id, &ServerMessage::from(error))
    }

    /// Enqueue a control message for one connection.
    pub fn send_control(&self, id: ConnectionId, message: &ServerMessage) -> Result<(), EngineError> {
        let connection = self
            .connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownConnection(id))?;

        Self::push_control(&connection, message)
    }

    pub(crate) fn push_control(
        connection: &Connection,
        message: &ServerMessage,
    ) -> Result<(), EngineError> {
        match connection.queue().push_control(message.to_payload()) {
            Enqueued::Rejected => Err(EngineError::UnknownConnection(connection.id())),
            _ => Ok(()),
        }
    }

    /// Start routing events for `keys` to `connection`.
    pub fn add_interest<'a>(
        &self,
        connection: &Arc<Connection>,
        keys: impl IntoIterator<Item = &'a AggregatorKey>,
    ) {
        let mut interest = self.interest.write();
        for key in keys {
            let connections = interest.entry(key.clone()).or_default();
            if !connections.iter().any(|existing| existing.id() == connection.id()) {
                connections.push(Arc::clone(connection));
            }
        }
    }

    /// Stop routing events for `keys` to connection `id`. Takes effect before returning.
    pub fn remove_interest<'a>(
        &self,
        id: ConnectionId,
        keys: impl IntoIterator<Item = &'a AggregatorKey>,
    ) {
        let mut interest = self.interest.write();
        for key in keys {
            let Some(connections) = interest.get_mut(key) else {
                continue;
            };
            connections.retain(|connection| connection.id() != id);
            if connections.is_empty() {
                interest.remove(key);
            }
        }
    }

    /// Number of connections receiving events for `key`.
    pub fn interested(&self, key: &AggregatorKey) -> usize {
        self.interest.read().get(key).map_or(0, Vec::len)
    }

    pub(crate) fn clear(&self) {
        self.interest.write().clear();
    }
}

impl CandleSink for Broadcaster {
    fn on_candle_event(&self, event: &CandleEvent) {
        Broadcaster::on_candle_event(self, event);
    }
}
