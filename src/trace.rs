use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::types::{JobId, ParentRelationship, TracingOptions};

/// Options handed to the tracer when a job span opens
#[derive(Debug, Clone)]
pub struct SpanOptions {
    pub name: String,
    pub job_id: JobId,
    pub relationship: ParentRelationship,
    pub parent: Option<Value>,
}

/// Capability interface for an external tracer
pub trait Tracer: Send + Sync {
    fn start_span(&self, options: SpanOptions) -> Box<dyn TraceSpan>;
}

/// One open span; the correlator only carries its context token, never
/// interprets it
pub trait TraceSpan: Send {
    /// Opaque correlation token embedded into the job payload
    fn context(&self) -> String;

    /// Tag the span as errored with a message
    fn set_error(&mut self, message: &str);

    /// Close the span
    fn finish(&mut self);
}

/// Span-per-job correlation from producer enqueue to terminal event.
///
/// With no tracer configured every call is a no-op, so the producer never
/// branches on "is tracing configured" beyond construction.
pub struct TraceCorrelator {
    tracer: Option<Arc<dyn Tracer>>,
    open: Mutex<HashMap<JobId, Box<dyn TraceSpan>>>,
}

impl TraceCorrelator {
    pub fn new(tracer: Option<Arc<dyn Tracer>>) -> Self {
        Self {
            tracer,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Open a span for a job and return its context token, `None` when no
    /// tracer is configured
    pub fn start_span(&self, job_id: &JobId, options: Option<&TracingOptions>) -> Option<String> {
        let tracer = self.tracer.as_ref()?;
        let name = options
            .and_then(|o| o.name.clone())
            .unwrap_or_else(|| "create-job".to_string());
        let span = tracer.start_span(SpanOptions {
            name,
            job_id: job_id.clone(),
            relationship: options
                .map(|o| o.parent_relationship)
                .unwrap_or_default(),
            parent: options.and_then(|o| o.parent.clone()),
        });
        let token = span.context();
        self.open.lock().insert(job_id.clone(), span);
        Some(token)
    }

    /// Finish the span for a job id exactly once, error-tagging when `error`
    /// is present. No-op when no span is open for the id.
    pub fn finish_span(&self, job_id: &JobId, error: Option<&str>) {
        let span = self.open.lock().remove(job_id);
        if let Some(mut span) = span {
            if let Some(message) = error {
                span.set_error(message);
            }
            span.finish();
        }
    }
}

/// Test tracer that records every finished span
pub struct RecordingTracer {
    finished: Arc<Mutex<Vec<FinishedSpan>>>,
}

/// Record of a span closed by the correlator
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub name: String,
    pub job_id: JobId,
    pub token: String,
    pub error: Option<String>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self {
            finished: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn finished_spans(&self) -> Vec<FinishedSpan> {
        self.finished.lock().clone()
    }
}

impl Default for RecordingTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, options: SpanOptions) -> Box<dyn TraceSpan> {
        Box::new(RecordingSpan {
            name: options.name,
            job_id: options.job_id,
            token: Uuid::new_v4().to_string(),
            error: None,
            sink: self.finished.clone(),
        })
    }
}

struct RecordingSpan {
    name: String,
    job_id: JobId,
    token: String,
    error: Option<String>,
    sink: Arc<Mutex<Vec<FinishedSpan>>>,
}

impl TraceSpan for RecordingSpan {
    fn context(&self) -> String {
        self.token.clone()
    }

    fn set_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }

    fn finish(&mut self) {
        self.sink.lock().push(FinishedSpan {
            name: self.name.clone(),
            job_id: self.job_id.clone(),
            token: self.token.clone(),
            error: self.error.take(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tracer_means_no_token() {
        let correlator = TraceCorrelator::disabled();
        let id = JobId::generate("encode");
        assert!(correlator.start_span(&id, None).is_none());
        // finish on an id with no span is a no-op
        correlator.finish_span(&id, None);
    }

    #[test]
    fn test_span_finishes_exactly_once() {
        let tracer = Arc::new(RecordingTracer::new());
        let correlator = TraceCorrelator::new(Some(tracer.clone()));
        let id = JobId::generate("encode");

        let token = correlator.start_span(&id, None).unwrap();
        assert!(!token.is_empty());

        correlator.finish_span(&id, None);
        correlator.finish_span(&id, None);

        let finished = tracer.finished_spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].token, token);
        assert_eq!(finished[0].error, None);
    }

    #[test]
    fn test_failed_span_carries_error_tag() {
        let tracer = Arc::new(RecordingTracer::new());
        let correlator = TraceCorrelator::new(Some(tracer.clone()));
        let id = JobId::generate("encode");

        let options = TracingOptions {
            name: Some("encode-span".to_string()),
            ..Default::default()
        };
        correlator.start_span(&id, Some(&options));
        correlator.finish_span(&id, Some("X"));

        let finished = tracer.finished_spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, "encode-span");
        assert_eq!(finished[0].error.as_deref(), Some("X"));
    }
}
