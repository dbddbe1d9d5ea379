//! Polling wait: re-issue a broadcast query until no matching task is still
//! running.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::FerryError;
use crate::ports::DocumentStore;
use crate::query::{QuerySpec, is_task_running, merge_replica_results};

/// Repeatedly broadcast a query and wait for every matching task document to
/// leave the CREATED / STARTED stages.
#[derive(Debug, Clone)]
pub struct PollingWait {
    poll_delay: Duration,
    deadline: Option<Duration>,
}

impl PollingWait {
    pub fn new(poll_delay: Duration) -> Self {
        Self {
            poll_delay,
            deadline: None,
        }
    }

    /// Bound the wait; exceeding it yields [`FerryError::PollDeadline`].
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Poll until no document matched by `query` is still running. Bodies are
    /// read from the merged broadcast results, so `query` must request
    /// expanded content. A result without a body counts as running.
    pub async fn wait_for_tasks_settled(
        &self,
        store: &Arc<dyn DocumentStore>,
        query: &QuerySpec,
    ) -> Result<(), FerryError> {
        let started_at = Instant::now();
        loop {
            let replica_results = store.broadcast_query(query).await?;
            let merged = merge_replica_results(replica_results);
            let running = merged
                .iter()
                .filter(|r| r.body.as_ref().is_none_or(is_task_running))
                .count();
            if running == 0 {
                return Ok(());
            }
            tracing::debug!(running, "waiting for tasks to settle");

            if let Some(deadline) = self.deadline
                && started_at.elapsed() + self.poll_delay > deadline
            {
                return Err(FerryError::PollDeadline(deadline));
            }
            tokio::time::sleep(self.poll_delay).await;
        }
    }
}
