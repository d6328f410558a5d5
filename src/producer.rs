use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CorrelatorError, CorrelatorResult};
use crate::registry::QueueRegistry;
use crate::substrate::{BoxStream, Substrate, SubstrateQueue, UnitSnapshot};
use crate::trace::{TraceCorrelator, Tracer};
use crate::types::view::parse_result_payload;
use crate::types::{
    options, JobId, JobNotification, JobOptions, JobSpec, JobView, LifecycleEvent, Settings,
};

/// Payload field carrying the trace context token to the consumer side
const SPAN_ID_FIELD: &str = "spanId";

/// Outcome of a settled `create_job` future
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Fire-and-forget submission: resolved with the job id right after the
    /// substrate accepted the unit
    Submitted(JobId),

    /// Resolved by the lifecycle event selected by the resolution policy
    Settled(JobView),
}

impl JobOutcome {
    /// Get the job id regardless of how the future settled
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Submitted(id) => id,
            Self::Settled(view) => &view.id,
        }
    }

    /// Get the settled view, if the resolution policy produced one
    pub fn view(&self) -> Option<&JobView> {
        match self {
            Self::Submitted(_) => None,
            Self::Settled(view) => Some(view),
        }
    }
}

/// In-process correlation record for one in-flight job.
///
/// The settle sender fires at most once; taking it out of the `Option` is the
/// idempotence guarantee. Terminal events and timeouts remove the whole
/// record, making any later event for the same id a no-op.
struct PendingJob {
    options: JobSpec,
    settle: Option<oneshot::Sender<CorrelatorResult<JobOutcome>>>,
    timer: Option<JoinHandle<()>>,
    submitted: bool,
    created_at: DateTime<Utc>,
}

impl PendingJob {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Producer-side correlation engine.
///
/// Owns the pending-job table and settles one future per submitted job from
/// the substrate's shared, at-least-once lifecycle channel. The caller picks
/// the observation point with the resolve-on flags; `failed` and `completed`
/// are always terminal for the table regardless of that policy.
pub struct ProducerCorrelator {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    registry: QueueRegistry,
    pending: Mutex<HashMap<JobId, PendingJob>>,
    notifications: broadcast::Sender<JobNotification>,
    tracing: TraceCorrelator,
}

impl ProducerCorrelator {
    /// Create a producer; settings are validated up front
    pub fn new(substrate: Arc<dyn Substrate>, settings: Settings) -> CorrelatorResult<Self> {
        Self::build(substrate, settings, None)
    }

    /// Create a producer with a tracer capability installed
    pub fn with_tracer(
        substrate: Arc<dyn Substrate>,
        settings: Settings,
        tracer: Arc<dyn Tracer>,
    ) -> CorrelatorResult<Self> {
        Self::build(substrate, settings, Some(tracer))
    }

    fn build(
        substrate: Arc<dyn Substrate>,
        settings: Settings,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> CorrelatorResult<Self> {
        options::check(&settings)?;
        let (notifications, _) = broadcast::channel(1024);
        Ok(Self {
            inner: Arc::new(ProducerInner {
                registry: QueueRegistry::new(substrate, settings),
                pending: Mutex::new(HashMap::new()),
                notifications,
                tracing: TraceCorrelator::new(tracer),
            }),
        })
    }

    /// Subscribe to job notifications (`job-waiting`, `job-active`,
    /// `job-failed`, `job-completed`, `job-error`)
    pub fn notifications(&self) -> BoxStream<JobNotification> {
        use tokio_stream::wrappers::BroadcastStream;
        let receiver = self.inner.notifications.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|result| futures::future::ready(result.ok())))
    }

    /// Submit a unit of work and await the outcome selected by the resolution
    /// policy.
    ///
    /// With no resolve-on flag set this resolves with the job id as soon as
    /// the substrate accepts the unit; otherwise it stays pending until the
    /// configured lifecycle event, the waiting timeout, or a submission error
    /// settles it. Exactly one of those wins.
    pub async fn create_job(&self, job_options: JobOptions) -> CorrelatorResult<JobOutcome> {
        options::check(&job_options)?;
        let JobOptions {
            job: spec,
            queue: queue_options,
            tracing: trace_options,
        } = job_options;

        let (queue, created) = self.inner.registry.get_or_create(&spec.job_type).await?;
        if created {
            self.spawn_event_pump(queue.clone());
        }

        let job_id = spec
            .id
            .clone()
            .map(JobId::from)
            .unwrap_or_else(|| JobId::generate(&spec.job_type));
        let (settle_tx, settle_rx) = oneshot::channel();

        // Timer races the lifecycle events; whichever runs first removes the
        // record and the other becomes a no-op.
        let timer = spec
            .waiting_timeout
            .filter(|timeout| *timeout > 0)
            .map(|timeout| {
                let inner = self.inner.clone();
                let queue = queue.clone();
                let id = job_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(timeout)).await;
                    inner.expire(queue, id).await;
                })
            });

        // The record goes in before submission so a lifecycle event racing
        // the enqueue is never missed.
        {
            let mut pending = self.inner.pending.lock();
            pending.insert(
                job_id.clone(),
                PendingJob {
                    options: spec.clone(),
                    settle: Some(settle_tx),
                    timer,
                    submitted: false,
                    created_at: Utc::now(),
                },
            );
        }

        let mut payload = spec.data.clone();
        if let Some(token) = self.inner.tracing.start_span(&job_id, trace_options.as_ref()) {
            embed_span_token(&mut payload, token);
        }

        debug!(id = %job_id, job_type = %spec.job_type, "submitting job");
        match queue.enqueue(&job_id, payload, &queue_options).await {
            Ok(()) => {
                let mut pending = self.inner.pending.lock();
                if let Some(job) = pending.get_mut(&job_id) {
                    job.submitted = true;
                    if !job.options.resolve_on_start && !job.options.resolve_on_complete {
                        if let Some(tx) = job.settle.take() {
                            let _ = tx.send(Ok(JobOutcome::Submitted(job_id.clone())));
                        }
                    }
                }
            }
            Err(error) => {
                let removed = self.inner.take(&job_id);
                self.inner
                    .tracing
                    .finish_span(&job_id, Some(&error.to_string()));
                if let Some(mut job) = removed {
                    if let Some(tx) = job.settle.take() {
                        let _ = tx.send(Err(CorrelatorError::Submission(error.to_string())));
                    }
                }
            }
        }

        settle_rx.await.map_err(|_| {
            CorrelatorError::Substrate("pending job dropped before settlement".to_string())
        })?
    }

    /// Read-through to the substrate's view of a unit
    pub async fn get_job(&self, job_type: &str, id: &JobId) -> CorrelatorResult<Option<UnitSnapshot>> {
        let queue = self
            .inner
            .registry
            .get(job_type)
            .await
            .ok_or_else(|| CorrelatorError::NotRegistered(job_type.to_string()))?;
        queue.get_unit(id).await
    }

    /// Best-effort discard of a live unit; "already gone" counts as success
    pub async fn stop_job(&self, job_type: &str, id: &JobId) -> CorrelatorResult<()> {
        let queue = self
            .inner
            .registry
            .get(job_type)
            .await
            .ok_or_else(|| CorrelatorError::NotRegistered(job_type.to_string()))?;
        let _ = queue.discard(id).await?;
        Ok(())
    }

    /// Rehydrate pending records for jobs submitted by a previous process.
    ///
    /// Restored records have no continuation to settle; lifecycle events for
    /// them still cancel nothing, emit notifications, and clean the table.
    pub fn restore_jobs(&self, jobs: Vec<(JobId, JobSpec)>) {
        let mut pending = self.inner.pending.lock();
        for (id, spec) in jobs {
            pending.insert(
                id,
                PendingJob {
                    options: spec,
                    settle: None,
                    timer: None,
                    submitted: true,
                    created_at: Utc::now(),
                },
            );
        }
    }

    /// Number of live pending records, for introspection and tests
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn spawn_event_pump(&self, queue: Arc<dyn SubstrateQueue>) {
        let inner = self.inner.clone();
        let mut events = queue.events();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                inner.handle_event(event);
            }
        });
    }
}

impl ProducerInner {
    fn prefix(&self) -> &str {
        &self.registry.settings().prefix
    }

    fn view(&self, id: &JobId, options: &JobSpec) -> JobView {
        JobView::new(id.clone(), options.clone(), self.prefix().to_string())
    }

    /// Atomically remove a pending record, cancelling its timer
    fn take(&self, id: &JobId) -> Option<PendingJob> {
        let mut job = self.pending.lock().remove(id)?;
        job.cancel_timer();
        Some(job)
    }

    fn emit(&self, notification: JobNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Waiting-timeout path: remove the record, best-effort discard, reject.
    /// A lifecycle event that got here first already removed the record and
    /// this becomes a no-op.
    async fn expire(&self, queue: Arc<dyn SubstrateQueue>, id: JobId) {
        let removed = self.pending.lock().remove(&id);
        let Some(mut job) = removed else {
            return;
        };
        let waited_ms = (Utc::now() - job.created_at).num_milliseconds();
        debug!(id = %id, waited_ms, "waiting timeout fired");
        if job.submitted {
            // Cleanup failures are immaterial; the timeout is the outcome.
            if let Err(error) = queue.discard(&id).await {
                debug!(id = %id, %error, "discard after timeout failed");
            }
        }
        self.tracing.finish_span(&id, Some("waiting timeout"));
        if let Some(tx) = job.settle.take() {
            let _ = tx.send(Err(CorrelatorError::WaitingTimeout {
                job_id: id.to_string(),
            }));
        }
    }

    /// One handler per event kind; unknown ids are expected under shared
    /// channel fan-out and ignored.
    fn handle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Waiting { id } => self.on_observed(&id, Observation::Waiting),
            LifecycleEvent::Active { id } => self.on_observed(&id, Observation::Active),
            LifecycleEvent::Failed { id, error } => self.on_failed(&id, error),
            LifecycleEvent::Completed { id, result } => self.on_completed(&id, &result),
            LifecycleEvent::ChannelError { error } => {
                warn!(%error, "substrate channel error");
                self.emit(JobNotification::Error(error));
            }
        }
    }

    /// Waiting and active share the non-terminal discipline: cancel the
    /// timer, notify, resolve only if the policy picked this point, and keep
    /// the record for the terminal event.
    fn on_observed(&self, id: &JobId, observation: Observation) {
        let (view, settle) = {
            let mut pending = self.pending.lock();
            let Some(job) = pending.get_mut(id) else {
                debug!(id = %id, event = observation.name(), "event for unknown job id, ignoring");
                return;
            };
            job.cancel_timer();
            let resolve_here = match observation {
                Observation::Waiting => job.options.resolve_on_waiting,
                Observation::Active => job.options.resolve_on_start,
            };
            let settle = if resolve_here { job.settle.take() } else { None };
            (self.view(id, &job.options), settle)
        };
        match observation {
            Observation::Waiting => self.emit(JobNotification::Waiting(view.clone())),
            Observation::Active => self.emit(JobNotification::Active(view.clone())),
        }
        if let Some(tx) = settle {
            let _ = tx.send(Ok(JobOutcome::Settled(view)));
        }
    }

    /// Terminal: always rejects and removes the record.
    ///
    /// This includes a fire-and-forget job whose failed event outruns the
    /// enqueue acknowledgement: unlike the completed arm, which falls back to
    /// resolving with the job id, a known failure is reported as the failure
    /// rather than masked by a bare id.
    fn on_failed(&self, id: &JobId, error: String) {
        let Some(mut job) = self.take(id) else {
            debug!(id = %id, "failed event for unknown job id, ignoring");
            return;
        };
        self.tracing.finish_span(id, Some(&error));
        let view = self.view(id, &job.options).with_error(error.clone());
        self.emit(JobNotification::Failed(view));
        if let Some(tx) = job.settle.take() {
            let _ = tx.send(Err(CorrelatorError::JobFailed(error)));
        }
    }

    /// Terminal: removes the record even when nobody is waiting on it
    fn on_completed(&self, id: &JobId, raw_result: &str) {
        let Some(mut job) = self.take(id) else {
            debug!(id = %id, "completed event for unknown job id, ignoring");
            return;
        };
        self.tracing.finish_span(id, None);
        let result = parse_result_payload(raw_result);
        let view = self.view(id, &job.options).with_result(result);
        self.emit(JobNotification::Completed(view.clone()));
        if job.options.resolve_on_complete {
            if let Some(tx) = job.settle.take() {
                let _ = tx.send(Ok(JobOutcome::Settled(view)));
            }
        } else if !job.options.resolve_on_start {
            // Fire-and-forget whose completion outran the enqueue
            // acknowledgement: settle with the job id as the submit path
            // would have.
            if let Some(tx) = job.settle.take() {
                let _ = tx.send(Ok(JobOutcome::Submitted(id.clone())));
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Observation {
    Waiting,
    Active,
}

impl Observation {
    fn name(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
        }
    }
}

fn embed_span_token(payload: &mut serde_json::Value, token: String) {
    match payload {
        serde_json::Value::Object(map) => {
            map.insert(SPAN_ID_FIELD.to_string(), serde_json::Value::String(token));
        }
        serde_json::Value::Null => {
            *payload = serde_json::json!({ SPAN_ID_FIELD: token });
        }
        // Non-object payloads have nowhere to carry the token
        _ => {}
    }
}
