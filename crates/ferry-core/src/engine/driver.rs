//! DocumentDriver: the per-document driver loop.
//!
//! Each workflow document gets one driver. The driver serializes all
//! operations (external patches and self-patches) through a single mpsc
//! queue, so no two patches are ever applied concurrently to one document's
//! state. Acknowledgment happens before side effects: the synchronous part of
//! an operation is validate + merge + ack, and all further work runs on
//! spawned tasks that feed new intents back into the same queue.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::workflow::{PatchOp, Workflow, WorkflowContext};
use crate::config::EngineConfig;
use crate::domain::{SubStage, TaskDocument, TaskStage};
use crate::error::FerryError;
use crate::ports::DocumentStore;

const OP_QUEUE_DEPTH: usize = 32;

/// Handle to a running document driver.
///
/// - `patch()` submits an external patch and resolves with the merged state
///   or a rejection.
/// - `state()` reads the latest acknowledged state.
/// - dropping the handle does not stop the loop; use `shutdown_and_join`.
#[derive(Debug)]
pub struct DriverHandle<S> {
    patch_tx: mpsc::Sender<PatchOp<S>>,
    state_rx: watch::Receiver<S>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl<S: TaskDocument> DriverHandle<S> {
    /// Latest acknowledged document state.
    pub fn state(&self) -> S {
        self.state_rx.borrow().clone()
    }

    /// Submit an external patch; resolves once the patch is acknowledged or
    /// rejected. Rejection leaves the document unchanged.
    pub async fn patch(&self, patch: S) -> Result<S, FerryError> {
        let (tx, rx) = oneshot::channel();
        let op = PatchOp {
            state: patch,
            reply: Some(tx),
        };
        self.patch_tx
            .send(op)
            .await
            .map_err(|_| FerryError::Transport("document driver stopped".to_string()))?;
        rx.await
            .map_err(|_| FerryError::Transport("document driver stopped".to_string()))?
    }

    /// Wait until the document reaches a terminal stage.
    pub async fn wait_terminal(&mut self) -> S {
        loop {
            {
                let state = self.state_rx.borrow_and_update();
                if state.task_state().stage.is_terminal() {
                    return state.clone();
                }
            }
            if self.state_rx.changed().await.is_err() {
                return self.state_rx.borrow().clone();
            }
        }
    }

    /// Request shutdown of the driver loop. In-flight side effects are not
    /// cancelled; their late self-patches are dropped.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

/// Starts document drivers.
pub struct DocumentDriver;

impl DocumentDriver {
    /// Handle document creation and start the driver loop.
    ///
    /// Normalizes defaults, validates, and synthesizes the initial STARTED +
    /// first-sub-stage state for CREATED documents before acknowledging (by
    /// returning). Unless processing is administratively disabled, a stage
    /// re-assertion self-patch is queued so the document drives itself.
    pub async fn start<W: Workflow>(
        workflow: Arc<W>,
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
        mut state: W::State,
    ) -> Result<DriverHandle<W::State>, FerryError> {
        workflow.normalize(&mut state, &config)?;
        workflow.validate(&state)?;

        if state.task_state().stage == TaskStage::Created {
            *state.task_state_mut() =
                crate::domain::TaskState::started(<W::State as TaskDocument>::Sub::first());
        }

        let self_link = state
            .self_link()
            .ok_or_else(|| FerryError::Validation("document has no self-link".to_string()))?
            .to_string();
        tracing::info!(self_link = %self_link, "starting document driver");

        persist::<W>(&store, &self_link, &state).await;

        let (patch_tx, patch_rx) = mpsc::channel(OP_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = WorkflowContext::new(
            Arc::clone(&store),
            config,
            self_link.clone(),
            patch_tx.clone(),
        );

        if state.processing_disabled() {
            tracing::info!(self_link = %self_link, "skipping start processing (disabled)");
        } else if state.task_state().stage == TaskStage::Started {
            let kick = W::State::patch_of(state.task_state().clone());
            let op = PatchOp {
                state: kick,
                reply: None,
            };
            patch_tx
                .send(op)
                .await
                .map_err(|_| FerryError::Transport("driver queue closed".to_string()))?;
        }

        let join = tokio::spawn(run_loop(
            workflow,
            ctx,
            self_link,
            state,
            patch_rx,
            state_tx,
            shutdown_rx,
        ));

        Ok(DriverHandle {
            patch_tx,
            state_rx,
            shutdown_tx,
            join,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<W: Workflow>(
    workflow: Arc<W>,
    ctx: WorkflowContext<W::State>,
    self_link: String,
    mut current: W::State,
    mut patch_rx: mpsc::Receiver<PatchOp<W::State>>,
    state_tx: watch::Sender<W::State>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let op = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            op = patch_rx.recv() => op,
        };
        let Some(op) = op else {
            break;
        };

        match handle_patch(&*workflow, &mut current, op.state) {
            Ok(()) => {
                let _ = state_tx.send(current.clone());
                if let Some(reply) = op.reply {
                    let _ = reply.send(Ok(current.clone()));
                }
                persist::<W>(&ctx.store, &self_link, &current).await;

                if current.processing_disabled() {
                    tracing::info!(self_link = %self_link, "skipping patch processing (disabled)");
                    continue;
                }
                if current.task_state().stage == TaskStage::Started {
                    let workflow = Arc::clone(&workflow);
                    let ctx = ctx.clone();
                    let snapshot = current.clone();
                    tokio::spawn(async move {
                        if let Err(err) = workflow.process_started(&ctx, snapshot).await {
                            ctx.fail_task(&err).await;
                        }
                    });
                }
            }
            Err(err) => match op.reply {
                Some(reply) => {
                    let _ = reply.send(Err(err));
                }
                None => {
                    // A late self-patch racing a concurrent advance; the
                    // document state is unchanged.
                    tracing::warn!(self_link = %self_link, error = %err, "self-patch rejected");
                }
            },
        }
    }
    tracing::info!(self_link = %self_link, "document driver stopped");
}

/// Validate, merge, and commit one patch. Rejection leaves `current` intact.
fn handle_patch<W: Workflow>(
    workflow: &W,
    current: &mut W::State,
    patch: W::State,
) -> Result<(), FerryError> {
    current
        .task_state()
        .validate_progression(patch.task_state())?;
    workflow.validate_patch(current, &patch)?;

    let mut next = current.clone();
    if next.task_state() != patch.task_state() {
        tracing::info!(
            stage = %patch.task_state().stage,
            sub_stage = ?patch.task_state().sub_stage,
            "moving to stage"
        );
    }
    *next.task_state_mut() = patch.task_state().clone();
    workflow.apply_patch(&mut next, &patch);
    workflow.validate(&next)?;

    *current = next;
    Ok(())
}

/// Mirror the owner's state into the store so readers observe progress. The
/// owner's in-memory state stays authoritative, so a failed mirror write is
/// logged rather than failing the task.
async fn persist<W: Workflow>(store: &Arc<dyn DocumentStore>, self_link: &str, state: &W::State) {
    let body = match serde_json::to_value(state) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(self_link = %self_link, error = %e, "owner state not serializable");
            return;
        }
    };
    if let Err(e) = store.put(self_link, W::KIND, body).await {
        tracing::warn!(self_link = %self_link, error = %e, "owner state mirror write failed");
    }
}
