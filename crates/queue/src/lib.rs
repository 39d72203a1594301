//! Bounded-concurrency admission queue.
//!
//! Gates how many tasks run concurrently against a downstream dependency.
//! Tasks past the limit wait in FIFO order; a task's failure propagates
//! only to its caller and never blocks the queue.
//!
//! Two independent instances are used in practice: a small one for text
//! responses and a larger one for image-generation jobs, because the two
//! workloads hit different external capacity limits.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::debug;
use voxrelay_core::error::QueueError;

/// Read-only snapshot of queue occupancy, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Tasks currently running
    pub active: usize,
    /// Tasks waiting for a slot
    pub queued: usize,
    /// Configured concurrency limit
    pub max_concurrent: usize,
}

/// A FIFO admission gate with a fixed concurrency limit.
///
/// Built on a fair semaphore: permits are granted to waiters in the order
/// they asked, which gives the FIFO-among-waiters guarantee. No ordering
/// exists among tasks that acquired permits concurrently.
#[derive(Clone)]
pub struct AdmissionQueue {
    name: &'static str,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl AdmissionQueue {
    /// Create a queue allowing up to `max_concurrent` tasks at once.
    ///
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(name: &'static str, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            name,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run a task under the concurrency limit.
    ///
    /// If a slot is free the task starts immediately; otherwise this waits
    /// behind earlier callers. The task's output — success or failure —
    /// is returned to this caller and affects nobody else.
    pub async fn run<F, T>(&self, task: F) -> std::result::Result<T, QueueError>
    where
        F: Future<Output = T>,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = self.permits.acquire().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let _permit = permit.map_err(|_| QueueError::Closed)?;
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(queue = self.name, active = self.active.load(Ordering::SeqCst), "task admitted");

        let result = task.await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }

    /// Current occupancy snapshot.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent,
        }
    }
}
