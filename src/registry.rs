use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::CorrelatorResult;
use crate::substrate::{Substrate, SubstrateQueue};
use crate::types::Settings;

/// Lazy per-job-type cache of substrate connection handles.
///
/// Producer and consumer roles each own an independent registry; a handle,
/// once created, lives for the owner's lifetime. Connection setup runs inside
/// the cache lock, so concurrent callers for the same type cannot
/// double-subscribe.
pub struct QueueRegistry {
    substrate: Arc<dyn Substrate>,
    settings: Settings,
    queues: Mutex<HashMap<String, Arc<dyn SubstrateQueue>>>,
}

impl QueueRegistry {
    pub fn new(substrate: Arc<dyn Substrate>, settings: Settings) -> Self {
        Self {
            substrate,
            settings,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Get the cached handle for a job type, connecting on first use.
    ///
    /// The flag is `true` only for the call that created the handle, so the
    /// owner can install its event pump or worker exactly once. Connection
    /// failures propagate; nothing is retried here.
    pub async fn get_or_create(
        &self,
        job_type: &str,
    ) -> CorrelatorResult<(Arc<dyn SubstrateQueue>, bool)> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(job_type) {
            return Ok((queue.clone(), false));
        }
        let queue = self.substrate.connect(job_type, &self.settings).await?;
        queues.insert(job_type.to_string(), queue.clone());
        info!(job_type, prefix = %self.settings.prefix, "created queue handle");
        Ok((queue, true))
    }

    /// Get the cached handle for a job type without creating one
    pub async fn get(&self, job_type: &str) -> Option<Arc<dyn SubstrateQueue>> {
        self.queues.lock().await.get(job_type).cloned()
    }
}
