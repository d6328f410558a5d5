use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    BoxStream, Completion, Substrate, SubstrateQueue, UnitSnapshot, UnitState, WorkUnit,
    WorkerCallback,
};
use crate::error::{CorrelatorError, CorrelatorResult};
use crate::types::{JobId, LifecycleEvent, QueueOptions, Settings};

/// In-memory substrate for development and tests.
///
/// One shared instance stands in for the external queue engine: producer and
/// consumer roles each `connect` their own handle, but units and lifecycle
/// events for a given prefix/type pair flow through the same store.
pub struct MemorySubstrate {
    queues: Mutex<HashMap<String, MemoryQueue>>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn connect(
        &self,
        job_type: &str,
        settings: &Settings,
    ) -> CorrelatorResult<Arc<dyn SubstrateQueue>> {
        let key = format!("{}:{}", settings.prefix, job_type);
        let queue = {
            let mut queues = self.queues.lock();
            queues
                .entry(key)
                .or_insert_with(|| MemoryQueue::create(job_type, &settings.prefix))
                .clone()
        };
        Ok(Arc::new(queue))
    }
}

struct StoredUnit {
    payload: Value,
    priority: i64,
    state: UnitState,
    enqueued_at: DateTime<Utc>,
    remove_on_complete: bool,
    remove_on_fail: bool,
}

struct QueueState {
    /// Waiting unit ids, priority-ordered (1 = highest, unprioritized last)
    waiting: Vec<JobId>,
    units: HashMap<JobId, StoredUnit>,
    worker: Option<Arc<dyn WorkerCallback>>,
    paused: bool,
}

struct QueueShared {
    job_type: String,
    prefix: String,
    state: Mutex<QueueState>,
    events: broadcast::Sender<LifecycleEvent>,
    wake: Notify,
}

/// Handle to one in-memory queue, cheap to clone
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<QueueShared>,
}

impl MemoryQueue {
    fn create(job_type: &str, prefix: &str) -> Self {
        let (events, _) = broadcast::channel(1024);
        let shared = Arc::new(QueueShared {
            job_type: job_type.to_string(),
            prefix: prefix.to_string(),
            state: Mutex::new(QueueState {
                waiting: Vec::new(),
                units: HashMap::new(),
                worker: None,
                paused: false,
            }),
            events,
            wake: Notify::new(),
        });
        tokio::spawn(run_dispatch(shared.clone()));
        Self { shared }
    }
}

/// Sequential dispatch loop; one unit in flight per queue, which is the
/// substrate's concurrency model here.
async fn run_dispatch(shared: Arc<QueueShared>) {
    loop {
        let notified = shared.wake.notified();
        match take_next(&shared) {
            Some((id, worker, payload)) => {
                let _ = shared
                    .events
                    .send(LifecycleEvent::Active { id: id.clone() });
                let (done, rx) = Completion::channel();
                let unit = WorkUnit {
                    id: id.clone(),
                    job_type: shared.job_type.clone(),
                    payload,
                    prefix: shared.prefix.clone(),
                };
                worker.dispatch(unit, done).await;
                let outcome = rx
                    .await
                    .unwrap_or_else(|_| Err("completion handle dropped".to_string()));
                settle(&shared, &id, outcome);
            }
            None => notified.await,
        }
    }
}

fn take_next(shared: &QueueShared) -> Option<(JobId, Arc<dyn WorkerCallback>, Value)> {
    let mut state = shared.state.lock();
    if state.paused {
        return None;
    }
    let worker = state.worker.clone()?;
    if state.waiting.is_empty() {
        return None;
    }
    let id = state.waiting.remove(0);
    let unit = state.units.get_mut(&id)?;
    unit.state = UnitState::Active;
    Some((id.clone(), worker, unit.payload.clone()))
}

fn settle(shared: &QueueShared, id: &JobId, outcome: Result<Value, String>) {
    let event = {
        let mut state = shared.state.lock();
        let Some(unit) = state.units.get_mut(id) else {
            return;
        };
        match outcome {
            Ok(result) => {
                unit.state = UnitState::Completed;
                let raw = serde_json::to_string(&result).unwrap_or_default();
                if unit.remove_on_complete {
                    state.units.remove(id);
                }
                LifecycleEvent::Completed {
                    id: id.clone(),
                    result: raw,
                }
            }
            Err(error) => {
                unit.state = UnitState::Failed;
                if unit.remove_on_fail {
                    state.units.remove(id);
                }
                LifecycleEvent::Failed {
                    id: id.clone(),
                    error,
                }
            }
        }
    };
    let _ = shared.events.send(event);
}

fn insert_waiting(state: &mut QueueState, id: JobId, priority: i64) {
    let pos = state
        .waiting
        .iter()
        .position(|other| {
            state
                .units
                .get(other)
                .map(|unit| unit.priority > priority)
                .unwrap_or(true)
        })
        .unwrap_or(state.waiting.len());
    state.waiting.insert(pos, id);
}

#[async_trait]
impl SubstrateQueue for MemoryQueue {
    fn job_type(&self) -> &str {
        &self.shared.job_type
    }

    fn key_prefix(&self) -> &str {
        &self.shared.prefix
    }

    async fn enqueue(
        &self,
        id: &JobId,
        payload: Value,
        options: &QueueOptions,
    ) -> CorrelatorResult<()> {
        let priority = options.priority.unwrap_or(i64::MAX);
        let delayed = options.delay.unwrap_or(0) > 0;
        // The waiting event is announced only once a worker exists to
        // progress the unit; an unconsumed queue stays silent.
        let announce = {
            let mut state = self.shared.state.lock();
            if state.units.contains_key(id) {
                return Err(CorrelatorError::Submission(format!(
                    "duplicate unit id: {id}"
                )));
            }
            state.units.insert(
                id.clone(),
                StoredUnit {
                    payload,
                    priority,
                    state: if delayed {
                        UnitState::Delayed
                    } else {
                        UnitState::Waiting
                    },
                    enqueued_at: Utc::now(),
                    remove_on_complete: options.remove_on_complete,
                    remove_on_fail: options.remove_on_fail,
                },
            );
            if !delayed {
                insert_waiting(&mut state, id.clone(), priority);
            }
            state.worker.is_some()
        };
        if delayed {
            let shared = self.shared.clone();
            let id = id.clone();
            let delay = options.delay.unwrap_or(0);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let promoted = {
                    let mut state = shared.state.lock();
                    match state.units.get_mut(&id) {
                        Some(unit) if unit.state == UnitState::Delayed => {
                            unit.state = UnitState::Waiting;
                            let priority = unit.priority;
                            insert_waiting(&mut state, id.clone(), priority);
                            state.worker.is_some()
                        }
                        _ => false,
                    }
                };
                if promoted {
                    let _ = shared.events.send(LifecycleEvent::Waiting { id });
                }
                shared.wake.notify_one();
            });
        } else {
            if announce {
                let _ = self
                    .shared
                    .events
                    .send(LifecycleEvent::Waiting { id: id.clone() });
            }
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    async fn register_worker(&self, callback: Arc<dyn WorkerCallback>) -> CorrelatorResult<()> {
        let backlog = {
            let mut state = self.shared.state.lock();
            if state.worker.is_some() {
                debug!(job_type = %self.shared.job_type, "worker already installed, keeping first");
                return Ok(());
            }
            state.worker = Some(callback);
            state.waiting.clone()
        };
        // Catch-up announcements for units that arrived before the worker
        for id in backlog {
            let _ = self.shared.events.send(LifecycleEvent::Waiting { id });
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn pause(&self) -> CorrelatorResult<()> {
        self.shared.state.lock().paused = true;
        Ok(())
    }

    async fn resume(&self) -> CorrelatorResult<()> {
        self.shared.state.lock().paused = false;
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn get_unit(&self, id: &JobId) -> CorrelatorResult<Option<UnitSnapshot>> {
        let state = self.shared.state.lock();
        Ok(state.units.get(id).map(|unit| UnitSnapshot {
            id: id.clone(),
            job_type: self.shared.job_type.clone(),
            payload: unit.payload.clone(),
            state: unit.state.clone(),
            enqueued_at: unit.enqueued_at,
        }))
    }

    async fn discard(&self, id: &JobId) -> CorrelatorResult<bool> {
        let mut state = self.shared.state.lock();
        match state.units.get(id) {
            Some(unit) if unit.state == UnitState::Active => Ok(false),
            Some(_) => {
                state.waiting.retain(|other| other != id);
                state.units.remove(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn events(&self) -> BoxStream<LifecycleEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let receiver = self.shared.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|result| result.ok()))
    }
}
