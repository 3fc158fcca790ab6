//! Bounded FIFO task queue shared between the acceptor and the worker pool.
//!
//! A fixed-capacity ring buffer guarded by a single mutex, with two
//! condition variables: `not_full` wakes blocked producers and
//! `not_empty` wakes blocked consumers.
//!
//! Slots are allocated once at construction, so pushing never allocates.

use parking_lot::{Condvar, Mutex};
use std::fmt;

/// Error returned when a queue cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A queue must hold at least one task.
    ZeroCapacity,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::ZeroCapacity => write!(f, "queue capacity must be at least 1"),
        }
    }
}

impl std::error::Error for QueueError {}

/// A task that could not be enqueued, handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue is at capacity (only from `try_push`).
    Full(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected task.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(task) | PushError::Closed(task) => task,
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "task queue is full"),
            PushError::Closed(_) => write!(f, "task queue is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

/// Ring buffer state. Only ever touched with the queue mutex held.
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    fn insert(&mut self, task: T) {
        debug_assert!(self.slots[self.tail].is_none());
        self.slots[self.tail] = Some(task);
        self.tail = (self.tail + 1) % self.slots.len();
        self.count += 1;
    }

    fn remove(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let task = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.count -= 1;
        task
    }
}

/// Fixed-capacity blocking FIFO queue.
pub struct TaskQueue<T> {
    ring: Mutex<Ring<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    /// Create a queue holding at most `capacity` tasks.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Ok(Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                count: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        })
    }

    /// Append a task, blocking while the queue is full.
    ///
    /// Fails only if the queue is closed, before or while waiting.
    pub fn push(&self, task: T) -> Result<(), PushError<T>> {
        let mut ring = self.ring.lock();
        while ring.is_full() && !ring.closed {
            self.not_full.wait(&mut ring);
        }
        if ring.closed {
            return Err(PushError::Closed(task));
        }

        ring.insert(task);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append a task without waiting.
    pub fn try_push(&self, task: T) -> Result<(), PushError<T>> {
        let mut ring = self.ring.lock();
        if ring.closed {
            return Err(PushError::Closed(task));
        }
        if ring.is_full() {
            return Err(PushError::Full(task));
        }

        ring.insert(task);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest task, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed; tasks still buffered at
    /// that point are left for `drain`.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        while ring.count == 0 && !ring.closed {
            self.not_empty.wait(&mut ring);
        }
        if ring.closed {
            return None;
        }

        let task = ring.remove();
        drop(ring);
        self.not_full.notify_one();
        task
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Remove every buffered task in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        let mut ring = self.ring.lock();
        let mut tasks = Vec::with_capacity(ring.count);
        while let Some(task) = ring.remove() {
            tasks.push(task);
        }
        drop(ring);
        self.not_full.notify_all();
        tasks
    }

    /// Number of buffered tasks.
    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    /// Maximum number of buffered tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
