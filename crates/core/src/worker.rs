//! Worker pool collaborator trait.
//!
//! The platform side maintains a pool of bot workers (accounts/voice
//! members) and decides which one serves a given session. The pipeline
//! only needs to pick one, mark it busy for the duration of a completion
//! request, and record that it acted in a session.

use async_trait::async_trait;

use crate::message::SessionKey;

/// Opaque handle to a platform worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle(pub String);

/// External worker/session management collaborator.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Pick the worker that should serve this session, if any is available.
    async fn pick_worker(&self, session: &SessionKey) -> Option<WorkerHandle>;

    /// Record that a worker acted in a session (affinity bookkeeping).
    async fn record_action(&self, worker: &WorkerHandle, session: &SessionKey);

    /// Mark a worker as having an in-flight completion request.
    async fn start_request(&self, worker: &WorkerHandle);

    /// Mark the worker's in-flight request as finished.
    async fn end_request(&self, worker: &WorkerHandle);

    /// Number of workers in the pool.
    async fn worker_count(&self) -> usize;
}
