use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::view::JobView;

/// Lifecycle events delivered by the substrate's shared channel.
///
/// Delivery is at-least-once and out of order; handlers must tolerate
/// duplicates and events for ids they do not own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// Job accepted by the substrate and queued
    Waiting { id: JobId },

    /// Job picked up by a worker
    Active { id: JobId },

    /// Job failed with the worker's error message
    Failed { id: JobId, error: String },

    /// Job completed; result is the raw payload as delivered by the substrate
    Completed { id: JobId, result: String },

    /// Out-of-band channel error, not tied to a specific job
    ChannelError { error: String },
}

impl LifecycleEvent {
    /// Get the event kind name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "waiting",
            Self::Active { .. } => "active",
            Self::Failed { .. } => "failed",
            Self::Completed { .. } => "completed",
            Self::ChannelError { .. } => "error",
        }
    }

    /// Get the job ID this event refers to, if any
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Waiting { id }
            | Self::Active { id }
            | Self::Failed { id, .. }
            | Self::Completed { id, .. } => Some(id),
            Self::ChannelError { .. } => None,
        }
    }
}

/// Notifications emitted to the caller's application by the producer
#[derive(Debug, Clone)]
pub enum JobNotification {
    Waiting(JobView),
    Active(JobView),
    Failed(JobView),
    Completed(JobView),
    Error(String),
}

impl JobNotification {
    /// Get the notification kind name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting(_) => "job-waiting",
            Self::Active(_) => "job-active",
            Self::Failed(_) => "job-failed",
            Self::Completed(_) => "job-completed",
            Self::Error(_) => "job-error",
        }
    }

    /// Get the carried job view, if any
    pub fn view(&self) -> Option<&JobView> {
        match self {
            Self::Waiting(view)
            | Self::Active(view)
            | Self::Failed(view)
            | Self::Completed(view) => Some(view),
            Self::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_event_names() {
        let id = JobId::from("encode:1");
        assert_eq!(LifecycleEvent::Waiting { id: id.clone() }.name(), "waiting");
        assert_eq!(
            LifecycleEvent::Completed {
                id,
                result: String::new()
            }
            .name(),
            "completed"
        );
        assert_eq!(
            LifecycleEvent::ChannelError {
                error: "boom".to_string()
            }
            .job_id(),
            None
        );
    }
}
