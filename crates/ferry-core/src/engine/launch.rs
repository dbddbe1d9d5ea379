//! Child task launcher: create a task document and poll it to a terminal
//! stage.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::domain::TaskStage;
use crate::error::FerryError;
use crate::ports::DocumentStore;
use crate::query::extract_task_stage;

/// Create a child task at `factory_link` and poll it until `is_terminal`
/// accepts its stage. Resolves exactly once, with the child's final document
/// body.
///
/// A child without a readable `task_state.stage` is treated as still running;
/// a vanished child surfaces as the store's NotFound error.
pub async fn start_task_and_await(
    store: &Arc<dyn DocumentStore>,
    factory_link: &str,
    start_body: Value,
    is_terminal: impl Fn(TaskStage) -> bool,
    poll_delay: Duration,
) -> Result<Value, FerryError> {
    let self_link = store.create(factory_link, start_body).await?;
    tracing::debug!(child = %self_link, "child task created");

    loop {
        let body = store.get(&self_link).await?;
        if let Ok(stage) = extract_task_stage(&body)
            && is_terminal(stage)
        {
            tracing::debug!(child = %self_link, stage = %stage, "child task settled");
            return Ok(body);
        }
        tokio::time::sleep(poll_delay).await;
    }
}
