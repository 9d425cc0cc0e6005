//! Bounded blocking FIFO queue, grounded in `LinkedBlockingQueue.c`.
//!
//! The original hand-rolls a doubly-linked list plus a manual-reset event and
//! a mutex; a `VecDeque` behind a `Mutex`/`Condvar` gives the same semantics
//! without the pointer plumbing, per the "bounded MPSC channels" design note.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub enum OfferError {
    /// The queue was at capacity.
    BoundExceeded,
    /// `signal_shutdown` was called; the queue no longer accepts items.
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitError {
    /// `signal_shutdown` was called while waiting.
    Interrupted,
}

struct State<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// A bounded, blocking, FIFO queue with non-blocking and blocking consumer operations.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    has_data: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            has_data: Condvar::new(),
            capacity,
        }
    }

    /// Non-blocking enqueue. Fails with `BoundExceeded` at capacity or `Shutdown` after teardown.
    pub fn offer(&self, item: T) -> Result<(), OfferError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.shutdown {
            return Err(OfferError::Shutdown);
        }
        if state.items.len() >= self.capacity {
            return Err(OfferError::BoundExceeded);
        }
        state.items.push_back(item);
        self.has_data.notify_one();
        Ok(())
    }

    /// Blocks until an item is available or the queue is shut down.
    pub fn wait(&self) -> Result<T, WaitError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.shutdown {
                return Err(WaitError::Interrupted);
            }
            state = self.has_data.wait(state).expect("queue mutex poisoned");
        }
    }

    /// Blocks until an item is available, the queue is shut down, or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, WaitError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            if state.shutdown {
                return Err(WaitError::Interrupted);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let (guard, result) = self
                .has_data
                .wait_timeout(state, remaining)
                .expect("queue mutex poisoned");
            state = guard;
            if result.timed_out() {
                return Ok(None);
            }
        }
    }

    /// Non-blocking dequeue.
    pub fn poll(&self) -> Option<T> {
        self.state.lock().expect("queue mutex poisoned").items.pop_front()
    }

    /// Non-destructive peek at the head, by cloning.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state
            .lock()
            .expect("queue mutex poisoned")
            .items
            .front()
            .cloned()
    }

    /// Atomically swaps out every queued item.
    pub fn flush(&self) -> Vec<T> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.items.drain(..).collect()
    }

    /// Wakes every waiter with `WaitError::Interrupted` and rejects future offers.
    pub fn signal_shutdown(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.shutdown = true;
        self.has_data.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new(4);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        q.offer(3).unwrap();
        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.poll(), Some(2));
        assert_eq!(q.poll(), Some(3));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn offer_rejects_past_capacity() {
        let q = BoundedQueue::new(2);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        assert_eq!(q.offer(3), Err(OfferError::BoundExceeded));
    }

    #[test]
    fn shutdown_wakes_waiters() {
        let q: std::sync::Arc<BoundedQueue<i32>> = std::sync::Arc::new(BoundedQueue::new(4));
        let waiter = q.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(10));
        q.signal_shutdown();
        assert_eq!(handle.join().unwrap(), Err(WaitError::Interrupted));
        assert_eq!(q.offer(1), Err(OfferError::Shutdown));
    }

    #[test]
    fn flush_drains_atomically() {
        let q = BoundedQueue::new(4);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        assert_eq!(q.flush(), vec![1, 2]);
        assert!(q.is_empty());
    }
}
