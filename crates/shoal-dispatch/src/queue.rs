// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 20 February 2024

use crate::{observable::SharedObservable, DispatchError};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Why a push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    Full(Duration),
    Closed,
}

impl Refusal {
    pub(crate) fn to_error(self) -> DispatchError {
        match self {
            Refusal::Full(waited) => DispatchError::QueueFull(waited),
            Refusal::Closed => DispatchError::ShuttingDown,
        }
    }
}

/// An item handed back by a refused push.
pub(crate) struct Rejected<T> {
    pub(crate) item: T,
    pub(crate) reason: Refusal,
}

impl Rejected<SharedObservable> {
    /// Fail every request of the refused batch.
    pub(crate) fn fail(self) {
        let reason = self.reason;
        self.item.lock().fail(|| reason.to_error());
    }
}

/// Bounded blocking FIFO shared by producers and workers.
///
/// Producers wait while the queue is full, consumers wait while it is
/// empty. Closing wakes everyone; pushes fail and pops return `None`
/// from then on.
pub(crate) struct BatchQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BatchQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
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

    /// Append `item`, waiting for space at most `timeout` (forever if
    /// `None`).
    pub(crate) fn push(&self, item: T, timeout: Option<Duration>) -> Result<(), Rejected<T>> {
        let deadline = timeout.map(|limit| (limit, Instant::now() + limit));
        let mut state = self.state.lock();

        while !state.closed && state.items.len() >= self.capacity {
            match deadline {
                None => self.not_full.wait(&mut state),
                Some((limit, deadline)) => {
                    let timed_out = self.not_full.wait_until(&mut state, deadline).timed_out();
                    if timed_out && !state.closed && state.items.len() >= self.capacity {
                        return Err(Rejected {
                            item,
                            reason: Refusal::Full(limit),
                        });
                    }
                }
            }
        }

        if state.closed {
            return Err(Rejected {
                item,
                reason: Refusal::Closed,
            });
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting while the queue is empty. Returns
    /// `None` once the queue is closed.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }

            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }

            self.not_empty.wait(&mut state);
        }
    }

    /// Close the queue, returning everything still queued.
    pub(crate) fn close(&self) -> Vec<T> {
        let stranded = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };

        self.not_empty.notify_all();
        self.not_full.notify_all();
        stranded
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run `f` over the queued items while holding the queue lock.
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&VecDeque<T>) -> R) -> R {
        f(&self.state.lock().items)
    }
}

impl BatchQueue<SharedObservable> {
    /// Total number of requests across all queued batches.
    pub(crate) fn pending_requests(&self) -> usize {
        self.inspect(|items| {
            items
                .iter()
                .map(|batch| batch.lock().len())
                .sum()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchQueue, Refusal};
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn fifo() {
        let queue = BatchQueue::new(4);
        for idx in 0..4 {
            queue.push(idx, None).ok().unwrap();
        }

        assert_eq!(queue.len(), 4);
        for idx in 0..4 {
            assert_eq!(queue.pop(), Some(idx));
        }
    }

    #[test]
    fn full_queue_times_out() {
        let queue = BatchQueue::new(1);
        queue.push(1, None).ok().unwrap();

        let start = Instant::now();
        let rejected = queue
            .push(2, Some(Duration::from_millis(30)))
            .err()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(rejected.item, 2);
        assert_eq!(rejected.reason, Refusal::Full(Duration::from_millis(30)));
    }

    #[test]
    fn full_queue_blocks_until_pop() {
        let queue = Arc::new(BatchQueue::new(1));
        queue.push(1, None).ok().unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2, None).is_ok())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn close_wakes_consumers_and_returns_leftovers() {
        let queue = Arc::new(BatchQueue::<u32>::new(2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(queue.close().is_empty());
        assert_eq!(consumer.join().unwrap(), None);
        assert!(queue.is_closed());
    }

    #[test]
    fn close_wakes_blocked_producers() {
        let queue = Arc::new(BatchQueue::new(1));
        queue.push(1, None).ok().unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2, None).err().map(|rejected| rejected.reason))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.close(), vec![1]);
        assert_eq!(producer.join().unwrap(), Some(Refusal::Closed));
        assert!(queue.push(3, None).is_err());
        assert_eq!(queue.capacity(), 1);
    }
}
