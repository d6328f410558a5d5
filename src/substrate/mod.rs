pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::CorrelatorResult;
use crate::types::{JobId, LifecycleEvent, QueueOptions, Settings};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Connection factory for the external queue substrate
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Open (or reuse) the substrate-side queue for a job type.
    ///
    /// Fails only if the underlying connection fails; retry/backoff is the
    /// substrate's or the caller's responsibility.
    async fn connect(
        &self,
        job_type: &str,
        settings: &Settings,
    ) -> CorrelatorResult<Arc<dyn SubstrateQueue>>;
}

/// One substrate connection, scoped to a single job type
#[async_trait]
pub trait SubstrateQueue: Send + Sync {
    /// The job type this queue is scoped to
    fn job_type(&self) -> &str;

    /// Key/namespace prefix the queue lives under
    fn key_prefix(&self) -> &str;

    /// Submit a unit of work
    async fn enqueue(
        &self,
        id: &JobId,
        payload: Value,
        options: &QueueOptions,
    ) -> CorrelatorResult<()>;

    /// Install the per-unit dispatch callback for this queue
    async fn register_worker(&self, callback: Arc<dyn WorkerCallback>) -> CorrelatorResult<()>;

    /// Stop dispatching units until resumed
    async fn pause(&self) -> CorrelatorResult<()>;

    /// Resume dispatching units
    async fn resume(&self) -> CorrelatorResult<()>;

    /// Read a unit's current state, `None` when the substrate no longer has it
    async fn get_unit(&self, id: &JobId) -> CorrelatorResult<Option<UnitSnapshot>>;

    /// Best-effort discard of a unit that has not started processing.
    ///
    /// Returns `false` when the unit is already gone or already active.
    async fn discard(&self, id: &JobId) -> CorrelatorResult<bool>;

    /// Subscribe to this queue's lifecycle channel
    fn events(&self) -> BoxStream<LifecycleEvent>;
}

/// Per-unit dispatch callback installed by the consumer role
#[async_trait]
pub trait WorkerCallback: Send + Sync {
    async fn dispatch(&self, unit: WorkUnit, done: Completion);
}

/// A unit of work as handed to the dispatch callback
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub prefix: String,
}

/// Processing state of a unit inside the substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Read-through snapshot of a unit held by the substrate
#[derive(Debug, Clone)]
pub struct UnitSnapshot {
    pub id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub state: UnitState,
    pub enqueued_at: DateTime<Utc>,
}

/// Single-use completion handle for a dispatched unit.
///
/// Exactly one of `resolve` or `reject` may be called; both consume the
/// handle. Dropping it without calling either is reported to the substrate as
/// a failure.
pub struct Completion {
    tx: oneshot::Sender<Result<Value, String>>,
}

impl Completion {
    /// Create a completion pair; the substrate keeps the receiving half
    pub fn channel() -> (Self, oneshot::Receiver<Result<Value, String>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Signal success with a result payload
    pub fn resolve(self, result: Value) {
        let _ = self.tx.send(Ok(result));
    }

    /// Signal failure with an error message
    pub fn reject(self, error: impl Into<String>) {
        let _ = self.tx.send(Err(error.into()));
    }
}
