use crate::{
    candle::AggregatorKey,
    error::EngineError,
    registry::SubscriberId,
};
use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use fnv::FnvHashMap;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::time::Instant;

/// Connection lifecycle management: admission, subscriptions, heartbeats and teardown.
pub mod broker;

/// Bounded per-connection outbound queue with a drop-oldest backpressure policy.
pub mod queue;

/// [`Transport`](sender::Transport) abstraction and the per-connection sender task.
pub mod sender;

use queue::OutboundQueue;

/// Engine-assigned identifier, unique for the lifetime of the process.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct ConnectionId(pub u64);

impl From<ConnectionId> for SubscriberId {
    fn from(value: ConnectionId) -> Self {
        SubscriberId(value.0)
    }
}

/// Lifecycle state of a [`Connection`].
///
/// ```text
/// Connecting -> Active -> Draining -> Closed
///      |           |                    ^
///      +-----------+--------------------+
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[display("connecting")]
    Connecting,
    #[display("active")]
    Active,
    #[display("draining")]
    Draining,
    #[display("closed")]
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Closed)
                | (Active, Draining)
                | (Active, Closed)
                | (Draining, Closed)
        )
    }

    /// Counts towards the connection ceiling.
    pub fn is_open(self) -> bool {
        self != ConnectionState::Closed
    }
}

/// Keys and indicator names a connection currently receives.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Interest {
    pub keys: IndexSet<AggregatorKey>,
    /// Opaque pass-through metadata, stored but never interpreted.
    pub indicators: Vec<SmolStr>,
}

/// Point-in-time view of a single [`Connection`].
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub subscriptions: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub queue_depth: usize,
    pub connected_at: DateTime<Utc>,
}

/// One logical client connection.
///
/// Owned by the [`ConnectionBroker`](broker::ConnectionBroker) connection table and shared with
/// the [`Broadcaster`](crate::broadcast::Broadcaster) interest index and the sender task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    interest: Mutex<Interest>,
    queue: OutboundQueue,
    sent: AtomicU64,
    last_ack: Mutex<Instant>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(id: ConnectionId, queue_capacity: usize) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Connecting),
            interest: Mutex::new(Interest::default()),
            queue: OutboundQueue::new(queue_capacity),
            sent: AtomicU64::new(0),
            last_ack: Mutex::new(Instant::now()),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        SubscriberId::from(self.id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, EngineError> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                connection: self.id,
                from,
                to: next,
            });
        }
        *state = next;
        Ok(from)
    }

    /// Snapshot of the current subscription set.
    pub fn interest(&self) -> Interest {
        self.interest.lock().clone()
    }

    pub(crate) fn interest_mut(&self) -> parking_lot::MutexGuard<'_, Interest> {
        self.interest.lock()
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acknowledge(&self, now: Instant) {
        *self.last_ack.lock() = now;
    }

    pub fn last_ack(&self) -> Instant {
        *self.last_ack.lock()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            state: self.state(),
            subscriptions: self.interest.lock().keys.len(),
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.queue.dropped(),
            queue_depth: self.queue.len(),
            connected_at: self.connected_at,
        }
    }
}

/// Table of every open connection, shared by the broker and the broadcaster.
pub type ConnectionTable = RwLock<FnvHashMap<ConnectionId, Arc<Connection>>>;
