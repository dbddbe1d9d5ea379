//! Workflow trait: what a concrete workflow plugs into the driver.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::domain::{ErrorInfo, TaskDocument, TaskState};
use crate::error::FerryError;
use crate::ports::DocumentStore;

/// One operation delivered to a document's driver loop.
///
/// Self-patches carry no reply channel; external patches are acknowledged
/// through `reply` before any side effects run.
pub(crate) struct PatchOp<S> {
    pub state: S,
    pub reply: Option<oneshot::Sender<Result<S, FerryError>>>,
}

/// A concrete workflow: document normalization, validation, field merge, and
/// the sub-stage side effects.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    type State: TaskDocument + Serialize;

    /// Document kind used when mirroring owner state into the store.
    const KIND: &'static str;

    /// Fill defaults on a newly created document. Runs before validation.
    fn normalize(&self, state: &mut Self::State, config: &EngineConfig) -> Result<(), FerryError>;

    /// Required-field and invariant validation of a full document.
    fn validate(&self, state: &Self::State) -> Result<(), FerryError>;

    /// Patch validation beyond stage progression: immutable and write-once
    /// field protection. Stage progression itself is checked by the driver.
    fn validate_patch(
        &self,
        current: &Self::State,
        patch: &Self::State,
    ) -> Result<(), FerryError>;

    /// Merge the patch's mutable fields into `current`, last-write-wins per
    /// field. The task state has already been replaced by the driver.
    fn apply_patch(&self, current: &mut Self::State, patch: &Self::State);

    /// Sub-stage side effects. Runs on a spawned task after a patch has been
    /// acknowledged, while the document is STARTED. An error return becomes a
    /// FAILED self-patch; there is no way to silently stall the document.
    async fn process_started(
        &self,
        ctx: &WorkflowContext<Self::State>,
        state: Self::State,
    ) -> Result<(), FerryError>;
}

/// Capabilities handed to sub-stage handlers: the store, the engine config,
/// and the self-patch intent queue.
pub struct WorkflowContext<S> {
    pub store: Arc<dyn DocumentStore>,
    pub config: EngineConfig,
    self_link: String,
    patch_tx: mpsc::Sender<PatchOp<S>>,
}

impl<S> Clone for WorkflowContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            self_link: self.self_link.clone(),
            patch_tx: self.patch_tx.clone(),
        }
    }
}

impl<S: TaskDocument> WorkflowContext<S> {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
        self_link: String,
        patch_tx: mpsc::Sender<PatchOp<S>>,
    ) -> Self {
        Self {
            store,
            config,
            self_link,
            patch_tx,
        }
    }

    pub fn self_link(&self) -> &str {
        &self.self_link
    }

    /// Queue a self-patch. Fire-and-forget: delivery failure means the driver
    /// loop is gone, which only happens on shutdown.
    pub async fn self_patch(&self, patch: S) {
        let op = PatchOp {
            state: patch,
            reply: None,
        };
        if self.patch_tx.send(op).await.is_err() {
            tracing::warn!(self_link = %self.self_link, "self-patch dropped: driver stopped");
        }
    }

    /// Terminate the document with a FAILED self-patch carrying the error.
    pub async fn fail_task(&self, err: &FerryError) {
        tracing::error!(self_link = %self.self_link, error = %err, "workflow task failed");
        self.self_patch(S::patch_of(TaskState::failed(ErrorInfo::from(err))))
            .await;
    }
}
