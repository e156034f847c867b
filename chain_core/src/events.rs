//! The typed event bus between the validator and its observers.
//!
//! Posting never blocks: each subscriber gets a bounded channel and events
//! that do not fit are dropped (and counted) rather than stalling block
//! validation. Within one block, events arrive in transaction order;
//! nothing is guaranteed across blocks.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
};

use chain_types::{Block, Log, Transaction};
use parking_lot::Mutex;
use tracing::warn;

/// Events the processor publishes.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// A transaction was included in an accepted block.
    TxPost {
        /// The included transaction.
        tx: Transaction,
    },
    /// The logs one accepted transaction emitted, in emission order.
    Logs(Vec<Log>),
    /// A transient replay finished; carries every log it produced.
    PendingBlock {
        /// The replayed block.
        block: Block,
        /// All logs of the replay.
        logs: Vec<Log>,
    },
}

/// Default per-subscriber buffer.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Broadcast hub for [`ChainEvent`]s.
pub struct EventBus {
    subscribers: Mutex<Vec<SyncSender<ChainEvent>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(SUBSCRIBER_CAPACITY)
    }
}

impl EventBus {
    /// A bus with the default per-subscriber buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose subscribers each buffer up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber. Attach before the first `process` call to
    /// observe every event.
    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (tx, rx) = sync_channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publishes an event to every live subscriber. A full subscriber loses
    /// the event; a disconnected one is unregistered.
    pub fn post(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| match subscriber.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("subscriber buffer full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Events dropped so far because a subscriber could not keep up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_posted_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.post(ChainEvent::Logs(vec![]));
        match rx.try_recv().unwrap() {
            ChainEvent::Logs(logs) => assert!(logs.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let rx = bus.subscribe();

        for _ in 0..5 {
            bus.post(ChainEvent::Logs(vec![]));
        }
        assert_eq!(bus.dropped(), 3);
        assert_eq!(rx.iter().take(2).count(), 2);
    }

    #[test]
    fn dropped_receivers_are_unregistered() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.post(ChainEvent::Logs(vec![]));
        assert_eq!(bus.subscribe().try_recv().ok().map(|_| ()), None);
        assert_eq!(bus.dropped(), 0);
    }
}
