//! Bounded hand-off between callers and the delivery worker.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::{bounded as bounded_channel, select, Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, warn};

use crate::{message::Message, telemetry::Telemetry};

/// Default number of messages that can be waiting for delivery before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5000;

/// Outcome of [`Producer::enqueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// The message was added to the queue.
    Accepted,

    /// The queue was full, or the worker is gone, and the message was discarded.
    Dropped,
}

/// Outcome of [`Consumer::dequeue_or_shutdown`].
#[derive(Debug)]
pub enum Dequeued {
    /// The oldest message in the queue.
    Message(Message),

    /// The shutdown signal fired before a message became available.
    Shutdown,

    /// Every producer is gone and the queue is empty.
    Closed,
}

/// Creates a bounded message queue, returning the producing and consuming halves.
///
/// When the queue holds `capacity` messages, newly enqueued messages are dropped rather than blocking the caller.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn bounded(capacity: usize) -> (Producer, Consumer) {
    with_telemetry(capacity, Arc::default())
}

pub(crate) fn with_telemetry(capacity: usize, telemetry: Arc<Telemetry>) -> (Producer, Consumer) {
    assert!(capacity > 0, "queue capacity must be non-zero");

    let (tx, rx) = bounded_channel(capacity);
    let producer = Producer { tx, full_warned: Arc::new(AtomicBool::new(false)), telemetry };
    let consumer = Consumer { rx };
    (producer, consumer)
}

/// The producing half of the message queue.
#[derive(Clone)]
pub struct Producer {
    tx: Sender<Message>,
    full_warned: Arc<AtomicBool>,
    telemetry: Arc<Telemetry>,
}

impl Producer {
    /// Adds a message to the back of the queue without blocking.
    ///
    /// If the queue is full, the message is dropped. A warning is logged the first time the queue is observed full,
    /// and not again until a message has been accepted in between.
    pub fn enqueue(&self, message: Message) -> Enqueued {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.full_warned.store(false, Ordering::Relaxed);
                self.telemetry.track_queued();
                Enqueued::Accepted
            }
            Err(TrySendError::Full(message)) => {
                if !self.full_warned.swap(true, Ordering::Relaxed) {
                    warn!(capacity = self.capacity(), "Queue full. Dropping messages until there's room.");
                }
                debug!(payload = message.payload(), "Dropping message.");
                self.telemetry.track_dropped(1);
                Enqueued::Dropped
            }
            Err(TrySendError::Disconnected(message)) => {
                debug!(payload = message.payload(), "Delivery worker has stopped. Dropping message.");
                self.telemetry.track_dropped(1);
                Enqueued::Dropped
            }
        }
    }

    /// Returns the number of messages currently queued.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Returns `true` if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Returns the maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

/// The consuming half of the message queue.
pub struct Consumer {
    rx: Receiver<Message>,
}

impl Consumer {
    /// Removes the oldest message, blocking until one is available.
    ///
    /// Returns `None` once every producer is gone and the queue has been drained.
    pub fn dequeue_blocking(&self) -> Option<Message> {
        self.rx.recv().ok()
    }

    /// Removes the oldest message, blocking until one is available or until `shutdown` fires.
    ///
    /// The shutdown signal fires when a value is sent on it or when all of its senders are dropped.
    pub fn dequeue_or_shutdown(&self, shutdown: &Receiver<()>) -> Dequeued {
        select! {
            recv(self.rx) -> message => match message {
                Ok(message) => Dequeued::Message(message),
                Err(_) => Dequeued::Closed,
            },
            recv(shutdown) -> _ => Dequeued::Shutdown,
        }
    }

    /// Removes the oldest message if one is immediately available.
    pub fn try_dequeue(&self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Returns the number of messages currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
