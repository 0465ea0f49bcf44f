//! Serialized worker queue.
//!
//! [`AsyncQueue`] runs every task it is given on one dedicated OS thread, one
//! at a time, in the order the tasks were enqueued. Stream state machines and
//! datastore callbacks only ever run here, which is what lets them mutate
//! their state without coordinating with the network threads.
//!
//! Network I/O and timers do not run on the queue thread; they run on the
//! Tokio runtime whose [`Handle`] the queue carries, and hand their results
//! back through [`AsyncQueue::enqueue`].

use core::time::Duration;
use firestore_remote_core::{Error, Result};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{cell::Cell, sync::Arc, thread};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the queue whose worker thread this is, `0` elsewhere.
    static CURRENT_QUEUE: Cell<u64> = const { Cell::new(0) };
}

/// A single-threaded, FIFO task executor.
pub struct AsyncQueue {
    id: u64,
    name: String,
    runtime: Handle,
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

impl AsyncQueue {
    /// Spawns the worker thread and returns the queue feeding it.
    ///
    /// `runtime` is used for timers ([`Self::enqueue_after_delay`]) and is
    /// handed to anything that needs to perform network I/O on behalf of the
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the worker thread cannot be spawned.
    pub fn new(name: impl Into<String>, runtime: Handle) -> Result<Arc<Self>> {
        let name = name.into();
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel::<Task>();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(id, rx))
            .map_err(|e| Error::ChannelError {
                context: format!("failed to spawn worker queue thread: {e}"),
            })?;

        tracing::debug!(queue = %name, "Worker queue started");

        Ok(Arc::new(Self {
            id,
            name,
            runtime,
            tx: Mutex::new(Some(tx)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime used for timers and network work.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Appends `task` to the queue.
    ///
    /// Returns `false` (and drops the task) once the queue has been shut down.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Enqueues `task` once `delay` has elapsed.
    ///
    /// The returned [`DelayedOperation`] can cancel the task up until the
    /// moment it starts running on the queue, including after the timer has
    /// already fired.
    pub fn enqueue_after_delay<F>(self: &Arc<Self>, delay: Duration, task: F) -> DelayedOperation
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = token.clone();
        let cancelled = token.clone();
        let queue = Arc::downgrade(self);

        self.runtime.spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let Some(queue) = queue.upgrade() else {
                        return;
                    };
                    queue.enqueue(move || {
                        if !token.is_cancelled() {
                            task();
                        }
                    });
                }
            }
        });

        DelayedOperation { token: handle }
    }

    /// Runs `f` on the queue and resolves with its result.
    ///
    /// Must not be awaited from the queue thread itself.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if the queue no longer accepts tasks.
    /// - [`Error::ChannelError`] if the task was dropped without running.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.enqueue(move || {
            let _ = tx.send(f());
        }) {
            return Err(Error::ServiceShutdown);
        }

        rx.await.map_err(|_| Error::ChannelError {
            context: format!("worker queue '{}' dropped the task", self.name),
        })
    }

    /// Whether the caller is running on this queue's worker thread.
    pub fn is_current_queue(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == self.id)
    }

    /// Panics unless called from this queue's worker thread.
    #[track_caller]
    pub fn verify_is_current_queue(&self) {
        assert!(
            self.is_current_queue(),
            "must be called from worker queue '{}'",
            self.name
        );
    }

    /// Stops accepting tasks. Tasks that were already enqueued still run,
    /// after which the worker thread exits.
    pub fn shutdown(&self) {
        if self.tx.lock().take().is_some() {
            tracing::debug!(queue = %self.name, "Worker queue shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().is_none()
    }
}

fn worker_loop(id: u64, mut rx: mpsc::UnboundedReceiver<Task>) {
    CURRENT_QUEUE.with(|current| current.set(id));

    while let Some(task) = rx.blocking_recv() {
        task();
    }

    tracing::trace!(queue_id = id, "Worker queue stopped");
}

/// Handle to a task scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Debug)]
pub struct DelayedOperation {
    token: CancellationToken,
}

impl DelayedOperation {
    /// Prevents the task from running. Has no effect if it already ran.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
