//! Bounded task queue between the reactor and the worker pool

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// A unit dequeued by a worker: either work or the poison value that tells
/// the worker to exit.
#[derive(Debug, PartialEq, Eq)]
pub enum Message<T> {
    /// Work submitted by the reactor.
    Work(T),
    /// Poison. Dequeued exactly once per worker during shutdown.
    Shutdown,
}

/// Why an enqueue was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity. The caller treats this as admission
    /// backpressure, not a failure of the queue.
    Full,
    /// The queue has been shut down.
    Closed,
}

impl Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EnqueueError::Full => "task queue is full",
            EnqueueError::Closed => "task queue is shut down",
        })
    }
}

impl std::error::Error for EnqueueError {}

/// FIFO MPMC queue with a fixed capacity.
///
/// Producers enqueue without blocking (`try_enqueue`) or with blocking
/// (`enqueue_blocking`); consumers block in `dequeue`. Shutdown is
/// cooperative: `shutdown(n)` closes the queue to producers and appends
/// one poison per consumer, so queued work drains in order before the
/// consumers exit.
#[derive(Debug)]
pub struct TaskQueue<T> {
    tx: Sender<Message<T>>,
    rx: Receiver<Message<T>>,
    closed: AtomicBool,
}

impl<T> TaskQueue<T> {
    /// Creates a queue holding at most `capacity` messages.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues `work`, failing immediately when full or shut down.
    pub fn try_enqueue(&self, work: T) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }

        match self.tx.try_send(Message::Work(work)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(TrySendError::Disconnected(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Enqueues `work`, waiting for a slot while the queue is full.
    pub fn enqueue_blocking(&self, work: T) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }

        self.tx
            .send(Message::Work(work))
            .map_err(|_| EnqueueError::Closed)
    }

    /// Dequeues the next message, blocking while the queue is empty.
    ///
    /// Returns [`Message::Shutdown`] once the caller's poison arrives, or
    /// if the queue storage itself has gone away.
    pub fn dequeue(&self) -> Message<T> {
        self.rx.recv().unwrap_or(Message::Shutdown)
    }

    /// Closes the queue and wakes every consumer.
    ///
    /// Appends one poison per consumer behind any queued work, preserving
    /// FIFO order: outstanding work is still executed before the workers
    /// exit. Subsequent enqueues fail with [`EnqueueError::Closed`]
    /// without blocking. Idempotent.
    pub fn shutdown(&self, consumers: usize) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for _ in 0..consumers {
            if self.tx.send(Message::Shutdown).is_err() {
                break;
            }
        }
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
