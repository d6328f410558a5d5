use serde_json::Value;

use super::ids::JobId;
use super::options::JobSpec;

/// Read-only snapshot of a job's state, built fresh for every lifecycle event
#[derive(Debug, Clone)]
pub struct JobView {
    /// Job identifier
    pub id: JobId,

    /// The original job submission options
    pub options: JobSpec,

    /// Queue key prefix of the owning role
    pub prefix: String,

    /// Failure message, present on failed events
    pub error: Option<String>,

    /// Parsed result payload, present on completed events
    pub result: Option<Value>,
}

impl JobView {
    pub fn new(id: JobId, options: JobSpec, prefix: String) -> Self {
        Self {
            id,
            options,
            prefix,
            error: None,
            result: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Parse a substrate result payload defensively.
///
/// Malformed or non-JSON payloads pass through as raw string values, never an
/// error.
pub fn parse_result_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_json_result() {
        assert_eq!(parse_result_payload(r#"{"ok":true}"#), json!({"ok": true}));
    }

    #[test]
    fn test_malformed_payload_passes_through_raw() {
        assert_eq!(
            parse_result_payload("not-json{"),
            Value::String("not-json{".to_string())
        );
    }

    #[test]
    fn test_view_is_built_per_event() {
        let spec = JobSpec::new("encode");
        let view = JobView::new(JobId::from("encode:1"), spec, "jobs".to_string())
            .with_result(json!({"ok": true}));
        assert_eq!(view.prefix, "jobs");
        assert_eq!(view.result, Some(json!({"ok": true})));
        assert_eq!(view.error, None);
    }
}
