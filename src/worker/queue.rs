use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Outcome of [`JobQueue::poll`].
#[derive(Debug, PartialEq, Eq)]
pub enum Poll<T> {
    Item(T),
    TimedOut,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum QueueError {
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded blocking FIFO shared by many producers and one consumer.
///
/// Closing the queue wakes every waiter: blocked producers fail with
/// [`QueueError::Closed`], the consumer drains what is left and then sees
/// [`Poll::Closed`].
pub struct JobQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> JobQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.lock().items.len()
    }

    /// Blocks while the queue is full.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Waits up to `timeout` for the next item.
    pub fn poll(&self, timeout: Duration) -> Poll<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Poll::Item(item);
            }
            if state.closed {
                return Poll::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Poll::TimedOut;
            }
            state = self
                .not_empty
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Moves every immediately available item into `batch` without blocking.
    pub fn drain_into(&self, batch: &mut Vec<T>) -> usize {
        let mut state = self.lock();
        let drained = state.items.len();
        batch.extend(state.items.drain(..));
        if drained > 0 {
            self.not_full.notify_all();
        }
        drained
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
