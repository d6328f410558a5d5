use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CorrelatorError, CorrelatorResult};
use crate::registry::QueueRegistry;
use crate::substrate::{Completion, Substrate, WorkUnit, WorkerCallback};
use crate::types::{options, ConsumerOptions, JobId, Settings};

/// A dispatched unit of work as seen by the caller's handler.
///
/// Exactly one of `complete` or `fail` must be called to return control to
/// the substrate.
pub struct DispatchedJob {
    pub id: JobId,
    pub job_type: String,
    pub data: Value,
    pub prefix: String,
    done: Completion,
}

impl DispatchedJob {
    /// Signal success back to the substrate
    pub fn complete(self, result: Value) {
        self.done.resolve(result);
    }

    /// Signal failure back to the substrate
    pub fn fail(self, error: impl Into<String>) {
        self.done.reject(error);
    }
}

/// Caller-supplied handler for dispatched jobs
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: DispatchedJob);
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(DispatchedJob) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, job: DispatchedJob) {
        (self)(job).await;
    }
}

/// Per-job-type dispatch registry for the consumer role
pub struct ConsumerDispatcher {
    registry: QueueRegistry,
}

impl ConsumerDispatcher {
    /// Create a dispatcher; settings are validated up front
    pub fn new(substrate: Arc<dyn Substrate>, settings: Settings) -> CorrelatorResult<Self> {
        options::check(&settings)?;
        Ok(Self {
            registry: QueueRegistry::new(substrate, settings),
        })
    }

    /// Register a handler for a job type.
    ///
    /// Idempotent per type: the first call installs the substrate worker, a
    /// second call for the same type changes nothing. How many units run
    /// concurrently is governed by the substrate, not here.
    pub async fn register(
        &self,
        opts: &ConsumerOptions,
        handler: Arc<dyn JobHandler>,
    ) -> CorrelatorResult<()> {
        options::check(opts)?;
        let (queue, created) = self.registry.get_or_create(&opts.job.job_type).await?;
        if !created {
            debug!(job_type = %opts.job.job_type, "handler already registered, ignoring");
            return Ok(());
        }
        queue
            .register_worker(Arc::new(HandlerBridge { handler }))
            .await?;
        info!(job_type = %opts.job.job_type, "registered job handler");
        Ok(())
    }

    /// Pause dispatch for a job type; fails when the type was never registered
    pub async fn pause(&self, job_type: &str) -> CorrelatorResult<()> {
        let queue = self
            .registry
            .get(job_type)
            .await
            .ok_or_else(|| CorrelatorError::NotRegistered(job_type.to_string()))?;
        queue.pause().await
    }

    /// Resume dispatch for a job type; fails when the type was never registered
    pub async fn resume(&self, job_type: &str) -> CorrelatorResult<()> {
        let queue = self
            .registry
            .get(job_type)
            .await
            .ok_or_else(|| CorrelatorError::NotRegistered(job_type.to_string()))?;
        queue.resume().await
    }
}

/// Adapts a `JobHandler` to the substrate's per-unit dispatch callback
struct HandlerBridge {
    handler: Arc<dyn JobHandler>,
}

#[async_trait]
impl WorkerCallback for HandlerBridge {
    async fn dispatch(&self, unit: WorkUnit, done: Completion) {
        debug!(id = %unit.id, job_type = %unit.job_type, "dispatching unit");
        let job = DispatchedJob {
            id: unit.id,
            job_type: unit.job_type,
            data: unit.payload,
            prefix: unit.prefix,
            done,
        };
        self.handler.handle(job).await;
    }
}
