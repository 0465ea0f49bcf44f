//! Completion queue shared by every call a datastore issues.
//!
//! Network tasks register themselves with [`CompletionQueue::begin`] and post
//! one [`Completion`] per finished operation (start, read, write, finish). A
//! single consumer blocks on [`CompletionQueue::next`] and receives the
//! completions in the order they were posted.
//!
//! After [`CompletionQueue::shutdown`] no new operations may begin, but the
//! ones already outstanding can still post. `next` keeps returning their
//! completions and only yields `None` once every outstanding operation has
//! ended and nothing is left to deliver.

use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, sync::Arc};

/// A finished operation waiting to be handed to the worker queue.
pub struct Completion {
    callback: Box<dyn FnOnce() + Send + 'static>,
}

impl Completion {
    /// Runs the continuation attached to the operation.
    pub fn complete(self) {
        (self.callback)();
    }
}

struct State {
    ready: VecDeque<Completion>,
    pending: usize,
    shut_down: bool,
}

pub struct CompletionQueue {
    state: Mutex<State>,
    available: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                pending: 0,
                shut_down: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Registers an outstanding operation.
    ///
    /// Returns `None` once the queue has been shut down.
    pub fn begin(self: &Arc<Self>) -> Option<PendingOp> {
        let mut state = self.state.lock();
        if state.shut_down {
            return None;
        }
        state.pending += 1;
        Some(PendingOp {
            queue: Arc::clone(self),
        })
    }

    /// Blocks until a completion is available.
    ///
    /// Returns `None` only after shutdown, once every outstanding operation
    /// has ended and every posted completion has been returned.
    pub fn next(&self) -> Option<Completion> {
        let mut state = self.state.lock();
        loop {
            if let Some(completion) = state.ready.pop_front() {
                return Some(completion);
            }
            if state.shut_down && state.pending == 0 {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Stops accepting new operations.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        self.available.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Shut down, with nothing outstanding and nothing left to deliver.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.shut_down && state.pending == 0 && state.ready.is_empty()
    }

    pub fn pending_operations(&self) -> usize {
        self.state.lock().pending
    }

    fn push(&self, completion: Completion) {
        let mut state = self.state.lock();
        state.ready.push_back(completion);
        self.available.notify_one();
    }

    fn end(&self) {
        let mut state = self.state.lock();
        state.pending -= 1;
        if state.pending == 0 {
            self.available.notify_all();
        }
    }
}

/// An operation registered with a [`CompletionQueue`].
///
/// The operation stays outstanding, holding off the end of a drain, until
/// this guard is dropped.
pub struct PendingOp {
    queue: Arc<CompletionQueue>,
}

impl PendingOp {
    /// Queues `callback` for delivery.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Completion {
            callback: Box::new(callback),
        });
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.queue.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use portable_atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn completions_are_delivered_in_post_order() {
        let queue = CompletionQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let op = queue.begin().unwrap();
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            op.post(move || seen.lock().push(i));
        }
        drop(op);
        queue.shutdown();

        while let Some(completion) = queue.next() {
            completion.complete();
        }
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert!(queue.is_drained());
    }

    #[test]
    fn begin_fails_after_shutdown() {
        let queue = CompletionQueue::new();
        queue.shutdown();
        assert!(queue.begin().is_none());
        assert!(queue.next().is_none());
    }

    #[test]
    fn next_waits_for_outstanding_operations() {
        let queue = CompletionQueue::new();
        let op = queue.begin().unwrap();
        queue.shutdown();
        assert!(!queue.is_drained());
        assert_eq!(queue.pending_operations(), 1);

        let delivered = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let queue = Arc::clone(&queue);
            let delivered = Arc::clone(&delivered);
            thread::spawn(move || {
                while let Some(completion) = queue.next() {
                    completion.complete();
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        op.post(|| {});
        drop(op);

        consumer.join().unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(queue.is_drained());
    }
}
