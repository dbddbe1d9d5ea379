//! TaskDocument: the contract between the engine and a workflow's state type.

use super::state::{SubStage, TaskState};

/// A persisted workflow document, as the engine sees it.
///
/// Design:
/// - The document is the single source of truth for its task state.
/// - A "patch" is the same type with only the changed fields populated; the
///   engine replaces the task state wholesale (progression is validated
///   first) and the workflow merges the remaining fields.
pub trait TaskDocument: Clone + Send + Sync + 'static {
    type Sub: SubStage;

    fn task_state(&self) -> &TaskState<Self::Sub>;

    fn task_state_mut(&mut self) -> &mut TaskState<Self::Sub>;

    /// Document self-link, once assigned.
    fn self_link(&self) -> Option<&str>;

    /// A minimal patch document carrying only the given task state.
    fn patch_of(task_state: TaskState<Self::Sub>) -> Self;

    /// Whether self-driving is administratively disabled for this document.
    fn processing_disabled(&self) -> bool {
        false
    }
}
