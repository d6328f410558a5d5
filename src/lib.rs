//! # job-correlator: Job-Lifecycle Correlation over a Queue Substrate
//!
//! A correlation and dispatch layer for callers of a durable, priority-capable
//! queue engine. The substrate does storage, delivery, and retries; this crate
//! answers the question the substrate cannot: *which of my in-flight requests
//! does this lifecycle event belong to, and who is waiting on it?*
//!
//! ## What it gives you
//!
//! - **Exactly-once settlement**: one future per submitted job, settled by the
//!   lifecycle event the caller picks (`resolve_on_waiting` / `resolve_on_start` /
//!   `resolve_on_complete`), by a waiting timeout, or by a submission error -
//!   never by more than one of them.
//! - **Replay-safe event handling**: the shared channel is at-least-once and out
//!   of order; duplicates and foreign ids are no-ops by construction.
//! - **Per-type dispatch**: consumers register one handler per job type, get a
//!   normalized job view with a single-use completion handle, and can pause and
//!   resume each type independently.
//! - **Carried trace spans**: an optional tracer capability opens a span at
//!   enqueue, embeds its token into the payload for the consumer side, and
//!   closes it (error-tagged if needed) at the terminal event.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use job_correlator::prelude::*;
//!
//! async fn demo() -> CorrelatorResult<()> {
//!     let substrate = Arc::new(MemorySubstrate::new());
//!
//!     let consumer = ConsumerDispatcher::new(substrate.clone(), Settings::default())?;
//!     consumer
//!         .register(
//!             &ConsumerOptions::new("encode"),
//!             Arc::new(|job: DispatchedJob| async move {
//!                 job.complete(json!({ "ok": true }));
//!             }),
//!         )
//!         .await?;
//!
//!     let producer = ProducerCorrelator::new(substrate, Settings::default())?;
//!     let outcome = producer
//!         .create_job(
//!             JobOptions::new("encode")
//!                 .with_data(json!({ "x": 1 }))
//!                 .resolve_on_complete(),
//!         )
//!         .await?;
//!     println!("finished: {:?}", outcome.view());
//!     Ok(())
//! }
//! ```

pub mod consumer;
pub mod error;
pub mod producer;
pub mod registry;
pub mod substrate;
pub mod trace;
pub mod types;

pub use consumer::{ConsumerDispatcher, DispatchedJob, JobHandler};
pub use error::{CorrelatorError, CorrelatorResult};
pub use producer::{JobOutcome, ProducerCorrelator};
pub use registry::QueueRegistry;
pub use substrate::memory::MemorySubstrate;
pub use substrate::{
    BoxStream, Completion, Substrate, SubstrateQueue, UnitSnapshot, UnitState, WorkUnit,
    WorkerCallback,
};
pub use trace::{FinishedSpan, RecordingTracer, SpanOptions, TraceCorrelator, TraceSpan, Tracer};
pub use types::{
    ConsumerOptions, JobId, JobNotification, JobOptions, JobSpec, JobView, LifecycleEvent,
    ParentRelationship, QueueOptions, RedisOptions, Settings, TracingOptions,
};

/// Everything a producer or consumer caller usually needs
pub mod prelude {
    pub use crate::consumer::{ConsumerDispatcher, DispatchedJob, JobHandler};
    pub use crate::error::{CorrelatorError, CorrelatorResult};
    pub use crate::producer::{JobOutcome, ProducerCorrelator};
    pub use crate::substrate::memory::MemorySubstrate;
    pub use crate::substrate::Substrate;
    pub use crate::trace::Tracer;
    pub use crate::types::{
        ConsumerOptions, JobId, JobNotification, JobOptions, JobView, Settings,
    };

    pub use async_trait::async_trait;
}
