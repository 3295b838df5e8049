use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::Notify;

/// Delivery class of an [`Outbound`] message.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum MessageClass {
    /// Candle updates. May be dropped under backpressure.
    Data,
    /// Errors, heartbeats, acknowledgements. Never dropped, may exceed the soft capacity.
    Control,
}

/// Serialised message waiting to be written to a connection's transport.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Outbound {
    pub class: MessageClass,
    pub payload: Arc<str>,
}

/// Outcome of pushing onto an [`OutboundQueue`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Enqueued {
    Queued,
    /// Queue was full, the oldest data message was evicted to make room.
    EvictedOldest,
    /// Queue was full of control messages, the new data message was dropped.
    Dropped,
    /// Queue no longer accepts messages of this class.
    Rejected,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Outbound>,
    draining: bool,
    closed: bool,
}

/// Bounded, single-consumer outbound queue owned by one connection.
///
/// Producers never block: pushing is O(1) apart from the rare eviction scan. The consumer (the
/// connection's sender task) awaits [`OutboundQueue::recv`].
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push a droppable data message, evicting the oldest data message if at capacity.
    pub fn push_data(&self, payload: Arc<str>) -> Enqueued {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed || state.draining {
                return Enqueued::Rejected;
            }

            let outcome = if state.messages.len() < self.capacity {
                Enqueued::Queued
            } else {
                match state
                    .messages
                    .iter()
                    .position(|message| message.class == MessageClass::Data)
                {
                    Some(oldest) => {
                        state.messages.remove(oldest);
                        Enqueued::EvictedOldest
                    }
                    None => Enqueued::Dropped,
                }
            };

            if outcome != Enqueued::Dropped {
                state.messages.push_back(Outbound {
                    class: MessageClass::Data,
                    payload,
                });
            }
            outcome
        };

        match outcome {
            Enqueued::Queued => self.notify.notify_one(),
            Enqueued::EvictedOldest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            Enqueued::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Enqueued::Rejected => {}
        }
        outcome
    }

    /// Push a control message. Bypasses the capacity check; only rejected once closed.
    pub fn push_control(&self, payload: Arc<str>) -> Enqueued {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Enqueued::Rejected;
            }
            state.messages.push_back(Outbound {
                class: MessageClass::Control,
                payload,
            });
        }
        self.notify.notify_one();
        Enqueued::Queued
    }

    /// Pop the next message without waiting.
    pub fn try_recv(&self) -> Option<Outbound> {
        self.state.lock().messages.pop_front()
    }

    /// Wait for the next message. Returns `None` once the queue is closed, or draining and empty.
    pub async fn recv(&self) -> Option<Outbound> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(message) = state.messages.pop_front() {
                    return Some(message);
                }
                if state.draining {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting data messages; [`Self::recv`] ends once the backlog is flushed.
    pub fn begin_drain(&self) {
        self.state.lock().draining = true;
        self.notify.notify_one();
    }

    /// Discard every queued message and stop accepting new ones.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.messages.clear();
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Data messages dropped by the backpressure policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
