//! Single in-flight work queue
//!
//! Tasks run one at a time in arrival order. The depth counter covers
//! queued and running tasks so callers can wait for the queue to drain.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};

/// Serializes async tasks
#[derive(Default)]
pub struct TaskQueue {
    lock: Mutex<()>,
    depth: AtomicUsize,
    idle: Notify,
}

struct DepthGuard<'a>(&'a TaskQueue);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        if self.0.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after every previously queued task finished
    pub async fn run<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.depth.fetch_add(1, Ordering::SeqCst);
        let _depth = DepthGuard(self);
        let _turn = self.lock.lock().await;
        task().await
    }

    /// Queued plus running tasks
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Resolve once no task is queued or running
    pub async fn await_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.depth() == 0 {
                return;
            }
            notified.await;
        }
    }
}
