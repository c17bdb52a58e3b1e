//! Broadcaster: fans appended messages out to attached observers.
//!
//! Each observer owns a bounded `ObserverQueue` drained by its own forwarder
//! task. Pushing never blocks: when a queue is full the oldest low-value
//! message is dropped instead. Dropped messages stay in the operation log and
//! can be recovered through replay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use specstream_protocol::{MessageType, StreamMessage};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// What happened to a pushed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued after evicting an older entry
    Evicted { sequence: u64, message_type: MessageType },
    /// Queued beyond capacity: only error/complete messages were left
    Overflowed,
    Closed,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<StreamMessage>,
    closed: bool,
    dropped: u64,
}

/// Bounded per-observer delivery queue with a priority-aware drop policy
pub struct ObserverQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl ObserverQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without blocking.
    ///
    /// Drop order when full: oldest `thinking`, then oldest message that is
    /// neither `error` nor `complete`. Those two are never dropped.
    pub fn push(&self, message: StreamMessage) -> Delivery {
        let mut state = self.lock();
        if state.closed {
            return Delivery::Closed;
        }

        let mut delivery = Delivery::Queued;
        if state.items.len() >= self.capacity {
            let victim = state
                .items
                .iter()
                .position(|m| m.message_type == MessageType::Thinking)
                .or_else(|| {
                    state
                        .items
                        .iter()
                        .position(|m| !m.message_type.is_undroppable())
                });
            delivery = match victim.and_then(|idx| state.items.remove(idx)) {
                Some(evicted) => {
                    state.dropped += 1;
                    Delivery::Evicted {
                        sequence: evicted.sequence,
                        message_type: evicted.message_type,
                    }
                }
                None => Delivery::Overflowed,
            };
        }

        state.items.push_back(message);
        drop(state);
        self.notify.notify_one();
        delivery
    }

    /// Wait for the next message. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<StreamMessage> {
        loop {
            {
                let mut state = self.lock();
                if let Some(message) = state.items.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<StreamMessage> {
        self.lock().items.pop_front()
    }

    /// Stop accepting messages. Already queued messages can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

struct Observer {
    connection_id: u64,
    queue: Arc<ObserverQueue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    pub operations: usize,
    pub observers: usize,
    pub queued: usize,
    pub dropped: u64,
}

/// Per-operation sets of observer queues
pub struct Broadcaster {
    observers: DashMap<String, Vec<Observer>>,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            observers: DashMap::new(),
            queue_capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// A fresh queue sized for this broadcaster
    pub fn new_queue(&self) -> Arc<ObserverQueue> {
        ObserverQueue::new(self.queue_capacity)
    }

    /// Attach a connection's queue. Re-attaching the same connection replaces
    /// its previous queue.
    pub fn attach(&self, operation_id: &str, connection_id: u64, queue: Arc<ObserverQueue>) {
        let mut observers = self.observers.entry(operation_id.to_string()).or_default();
        if let Some(previous) = observers
            .iter()
            .position(|o| o.connection_id == connection_id)
        {
            observers.remove(previous).queue.close();
        }
        observers.push(Observer {
            connection_id,
            queue,
        });
        debug!(
            component = "broadcaster",
            event = "broadcast.attached",
            operation_id = %operation_id,
            connection_id = connection_id,
            observers = observers.len(),
            "Observer attached"
        );
    }

    /// Detach a connection and close its queue. Other observers are untouched.
    pub fn detach(&self, operation_id: &str, connection_id: u64) -> bool {
        let removed = match self.observers.get_mut(operation_id) {
            Some(mut observers) => {
                match observers
                    .iter()
                    .position(|o| o.connection_id == connection_id)
                {
                    Some(idx) => {
                        observers.remove(idx).queue.close();
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };
        self.observers
            .remove_if(operation_id, |_, observers| observers.is_empty());
        if removed {
            debug!(
                component = "broadcaster",
                event = "broadcast.detached",
                operation_id = %operation_id,
                connection_id = connection_id,
                "Observer detached"
            );
        }
        removed
    }

    /// Close every queue attached to an operation (used on eviction).
    pub fn detach_all(&self, operation_id: &str) -> usize {
        match self.observers.remove(operation_id) {
            Some((_, observers)) => {
                for observer in &observers {
                    observer.queue.close();
                }
                observers.len()
            }
            None => 0,
        }
    }

    /// Push a message into every attached queue. Returns the number of
    /// observers it was delivered to.
    pub fn publish(&self, message: &StreamMessage) -> usize {
        let delivered = match self.observers.get_mut(&message.operation_id) {
            Some(mut observers) => {
                observers.retain(|o| !o.queue.is_closed());
                for observer in observers.iter() {
                    match observer.queue.push(message.clone()) {
                        Delivery::Evicted {
                            sequence,
                            message_type,
                        } => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                component = "broadcaster",
                                event = "broadcast.dropped",
                                operation_id = %message.operation_id,
                                connection_id = observer.connection_id,
                                dropped_sequence = sequence,
                                dropped_type = message_type.as_str(),
                                "Observer queue full, dropped oldest message"
                            );
                        }
                        Delivery::Overflowed => {
                            debug!(
                                component = "broadcaster",
                                event = "broadcast.overflowed",
                                operation_id = %message.operation_id,
                                connection_id = observer.connection_id,
                                sequence = message.sequence,
                                "Observer queue over capacity with undroppable messages"
                            );
                        }
                        Delivery::Queued | Delivery::Closed => {}
                    }
                }
                observers.len()
            }
            None => 0,
        };
        if delivered == 0 {
            self.observers
                .remove_if(&message.operation_id, |_, observers| observers.is_empty());
        }
        delivered
    }

    pub fn observer_count(&self, operation_id: &str) -> usize {
        self.observers
            .get(operation_id)
            .map(|observers| observers.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BroadcasterStats {
        let mut observers = 0;
        let mut queued = 0;
        for entry in self.observers.iter() {
            observers += entry.value().len();
            queued += entry.value().iter().map(|o| o.queue.len()).sum::<usize>();
        }
        BroadcasterStats {
            operations: self.observers.len(),
            observers,
            queued,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
