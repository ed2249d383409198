//! Tracking of in-flight request handlers.
//!
//! Each inbound `request` runs on its own Tokio task so a slow handler
//! never stalls the receive loop. The pool remembers every running task so
//! a disconnect can abort them all at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

struct TrackedTask {
    request_id: String,
    abort: AbortHandle,
}

/// Registry of spawned request handlers.
#[derive(Clone, Default)]
pub struct RequestPool {
    tasks: Arc<Mutex<HashMap<u64, TrackedTask>>>,
    next_key: Arc<AtomicU64>,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` for request `request_id` on the current runtime.
    ///
    /// The task removes itself from the pool when it finishes.
    pub fn spawn<Fut>(&self, request_id: impl Into<String>, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Held across spawn + insert so a task that finishes immediately
        // cannot try to remove itself before it was inserted.
        let mut guard = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            fut.await;
            lock(&tasks).remove(&key);
        });
        guard.insert(
            key,
            TrackedTask {
                request_id: request_id.into(),
                abort: handle.abort_handle(),
            },
        );
    }

    /// Number of handlers still running.
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request ids of all running handlers (unordered).
    pub fn active_request_ids(&self) -> Vec<String> {
        lock(&self.tasks)
            .values()
            .map(|t| t.request_id.clone())
            .collect()
    }

    /// Abort every running handler. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<TrackedTask> = lock(&self.tasks).drain().map(|(_, t)| t).collect();
        for task in &drained {
            task.abort.abort();
        }
        drained.len()
    }
}

fn lock(
    tasks: &Mutex<HashMap<u64, TrackedTask>>,
) -> std::sync::MutexGuard<'_, HashMap<u64, TrackedTask>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
