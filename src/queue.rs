//! Fixed-capacity FIFO handoff with blocking-wait backpressure.
//!
//! [`BoundedQueue`] is the pull-side primitive of the pipeline: a producer
//! `put` suspends while the queue is full (it never drops and never grows),
//! and the queue can be closed terminally: normally, letting consumers drain
//! the remainder, or with an error that every pending and subsequent `get`
//! observes.
//!
//! A plain `tokio::sync::mpsc` channel gives the same backpressure but cannot
//! carry a terminal error to consumers, so the queue is built directly on a
//! mutex-guarded ring plus two [`Notify`] wake sets. Locks are never held
//! across an await point.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use crate::error::ScanError;

/// Error returned by [`BoundedQueue::put`] after the queue was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("queue is closed")]
pub struct QueueClosed;

#[derive(Debug)]
enum Terminal {
    Open,
    Closed,
    Failed(ScanError),
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    terminal: Terminal,
}

/// A fixed-capacity, multi-producer/multi-consumer FIFO queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Notify,
    not_empty: Notify,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                terminal: Terminal::Open,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item, suspending while the queue is full.
    ///
    /// Returns [`QueueClosed`] once the queue has been closed in either mode.
    /// Cancel-safe: dropping the future before it resolves leaves the queue
    /// unchanged (the item is dropped with the future).
    pub async fn put(&self, item: T) -> Result<(), QueueClosed> {
        let mut item = Some(item);
        loop {
            {
                let mut inner = self.lock();
                if !matches!(inner.terminal, Terminal::Open) {
                    return Err(QueueClosed);
                }
                if inner.items.len() < self.capacity {
                    if let Some(value) = item.take() {
                        inner.items.push_back(value);
                    }
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            // Full: register for a wakeup, then re-check so a slot freed (or
            // a close) between the check above and the registration is not
            // missed.
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if !matches!(inner.terminal, Terminal::Open)
                    || inner.items.len() < self.capacity
                {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Removes the oldest item, suspending while the queue is empty and open.
    ///
    /// Returns `Ok(None)` once the queue was closed normally and drained, or
    /// the terminal error if the queue was closed with one. A terminal error
    /// takes precedence over any undrained items.
    pub async fn get(&self) -> Result<Option<T>, ScanError> {
        loop {
            {
                let mut inner = self.lock();
                if let Terminal::Failed(err) = &inner.terminal {
                    return Err(err.clone());
                }
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(Some(item));
                }
                if matches!(inner.terminal, Terminal::Closed) {
                    return Ok(None);
                }
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if !inner.items.is_empty() || !matches!(inner.terminal, Terminal::Open) {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Closes the queue normally; consumers drain the remainder, then see
    /// end-of-sequence. Returns whether this call performed the close.
    pub fn close(&self) -> bool {
        self.terminate(Terminal::Closed)
    }

    /// Closes the queue with a terminal error observed by every consumer.
    /// First close wins; returns whether this call performed it.
    pub fn close_with_error(&self, error: ScanError) -> bool {
        self.terminate(Terminal::Failed(error))
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let mut inner = self.lock();
        if !matches!(inner.terminal, Terminal::Open) {
            return false;
        }
        inner.terminal = terminal;
        drop(inner);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        true
    }

    /// Whether the queue has been closed (in either mode).
    pub fn is_closed(&self) -> bool {
        !matches!(self.lock().terminal, Terminal::Open)
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
