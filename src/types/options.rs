use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::error::{CorrelatorError, CorrelatorResult};

/// Role settings shared by producer and consumer
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    /// Prefix for all queue keys
    #[validate(length(min = 1, message = "must not be empty"))]
    pub prefix: String,

    #[validate(nested)]
    pub redis: RedisOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefix: "jobs".to_string(),
            redis: RedisOptions::default(),
        }
    }
}

impl Settings {
    /// Override the queue key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Connection settings for the substrate's storage backend
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RedisOptions {
    pub host: String,
    pub port: u16,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

/// Full submission options for `create_job`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JobOptions {
    #[validate(nested)]
    pub job: JobSpec,

    #[validate(nested)]
    #[serde(default)]
    pub queue: QueueOptions,

    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingOptions>,
}

impl JobOptions {
    /// Create options for the given job type with defaults everywhere else
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job: JobSpec::new(job_type),
            queue: QueueOptions::default(),
            tracing: None,
        }
    }

    /// Set the job payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.job.data = data;
        self
    }

    /// Supply the job ID instead of generating one
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.job.id = Some(id.into());
        self
    }

    /// Reject the caller's future if no lifecycle event arrives within `millis`
    pub fn with_waiting_timeout(mut self, millis: u64) -> Self {
        self.job.waiting_timeout = Some(millis);
        self
    }

    /// Settle the caller's future when the waiting event arrives
    pub fn resolve_on_waiting(mut self) -> Self {
        self.job.resolve_on_waiting = true;
        self
    }

    /// Settle the caller's future when the active event arrives
    pub fn resolve_on_start(mut self) -> Self {
        self.job.resolve_on_start = true;
        self
    }

    /// Settle the caller's future when the completed event arrives
    pub fn resolve_on_complete(mut self) -> Self {
        self.job.resolve_on_complete = true;
        self
    }

    /// Attach tracing options
    pub fn with_tracing(mut self, tracing: TracingOptions) -> Self {
        self.tracing = Some(tracing);
        self
    }
}

/// Job section of the submission options
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JobSpec {
    /// The job type
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "is required"))]
    pub job_type: String,

    /// Caller-supplied job ID; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Opaque job payload handed to the consumer
    #[serde(default)]
    pub data: Value,

    /// Milliseconds to wait before the job is waiting/active/failed/completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_timeout: Option<u64>,

    #[serde(default)]
    pub resolve_on_waiting: bool,

    #[serde(default)]
    pub resolve_on_start: bool,

    #[serde(default)]
    pub resolve_on_complete: bool,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            id: None,
            data: Value::Null,
            waiting_timeout: None,
            resolve_on_waiting: false,
            resolve_on_start: false,
            resolve_on_complete: false,
        }
    }
}

/// Queue section forwarded to the substrate's enqueue
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueueOptions {
    /// Ranges from 1 (highest) upward
    pub priority: Option<i64>,

    /// Milliseconds to wait until the job can be processed
    pub delay: Option<u64>,

    /// Milliseconds after which the job fails with a timeout error
    pub timeout: Option<u64>,

    /// Total number of attempts until the job completes
    pub attempts: Option<u32>,

    /// Remove the job from the substrate when it completes
    pub remove_on_complete: bool,

    /// Remove the job from the substrate when it fails after all attempts
    pub remove_on_fail: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            priority: None,
            delay: None,
            timeout: None,
            attempts: None,
            remove_on_complete: true,
            remove_on_fail: true,
        }
    }
}

/// Relationship between the job span and its parent span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ParentRelationship {
    #[default]
    ChildOf,
    #[serde(rename = "follows")]
    FollowsFrom,
}

/// Tracing section of the submission options
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TracingOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    pub parent_relationship: ParentRelationship,
    pub parent: Option<Value>,
}

/// Registration options for the consumer role
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConsumerOptions {
    #[validate(nested)]
    pub job: ConsumerJobSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConsumerJobSpec {
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "is required"))]
    pub job_type: String,
}

impl ConsumerOptions {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job: ConsumerJobSpec {
                job_type: job_type.into(),
            },
        }
    }
}

/// Validate caller input, flattening errors into `field.path message` form
pub(crate) fn check<T: Validate>(input: &T) -> CorrelatorResult<()> {
    input
        .validate()
        .map_err(|errs| CorrelatorError::Validation(flatten_errors("", &errs)))
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn flatten_errors(prefix: &str, errs: &ValidationErrors) -> String {
    let mut messages = Vec::new();
    collect_errors(&mut messages, prefix, errs);
    messages.sort();
    messages.join("; ")
}

fn collect_errors(out: &mut Vec<String>, prefix: &str, errs: &ValidationErrors) {
    for (field, kind) in errs.errors() {
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                let key = join_path(prefix, field);
                for e in field_errors {
                    let msg = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string());
                    out.push(format!("{key} {msg}"));
                }
            }
            ValidationErrorsKind::Struct(struct_errs) => {
                let next = join_path(prefix, field);
                collect_errors(out, &next, struct_errs.as_ref());
            }
            ValidationErrorsKind::List(list_errs) => {
                let base = join_path(prefix, field);
                for (idx, nested) in list_errs {
                    collect_errors(out, &format!("{base}[{idx}]"), nested.as_ref());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_use_jobs_prefix() {
        let settings = Settings::default();
        assert_eq!(settings.prefix, "jobs");
        assert_eq!(settings.redis.host, "localhost");
        assert_eq!(settings.redis.port, 6379);
    }

    #[test]
    fn test_empty_job_type_fails_validation_with_field_path() {
        let options = JobOptions::new("");
        let err = check(&options).unwrap_err();
        match err {
            CorrelatorError::Validation(msg) => {
                assert!(msg.contains("job.job_type"), "unexpected message: {msg}");
                assert!(msg.contains("is required"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_options_pass() {
        let options = JobOptions::new("encode")
            .with_data(serde_json::json!({"x": 1}))
            .with_waiting_timeout(500)
            .resolve_on_complete();
        assert!(check(&options).is_ok());
        assert!(options.job.resolve_on_complete);
        assert_eq!(options.job.waiting_timeout, Some(500));
    }

    #[test]
    fn test_queue_options_default_to_remove_on_terminal() {
        let queue = QueueOptions::default();
        assert!(queue.remove_on_complete);
        assert!(queue.remove_on_fail);
        assert_eq!(queue.priority, None);
    }

    #[test]
    fn test_tracing_options_deserialize_with_relationship_default() {
        let tracing: TracingOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(tracing.parent_relationship, ParentRelationship::ChildOf);

        let tracing: TracingOptions =
            serde_json::from_str(r#"{"parentRelationship": "follows"}"#).unwrap();
        assert_eq!(tracing.parent_relationship, ParentRelationship::FollowsFrom);
    }

    #[test]
    fn test_job_spec_deserializes_from_wire_shape() {
        let options: JobOptions = serde_json::from_str(
            r#"{"job": {"type": "encode", "data": {"action": "bla"}, "resolve_on_complete": true}}"#,
        )
        .unwrap();
        assert_eq!(options.job.job_type, "encode");
        assert!(options.job.resolve_on_complete);
        assert!(options.queue.remove_on_complete);
    }
}
