//! Domain model: task lifecycle stages, task state, and patch documents.

pub mod control_flags;
pub mod document;
pub mod stage;
pub mod state;

pub use document::TaskDocument;
pub use stage::TaskStage;
pub use state::{ErrorInfo, SubStage, TaskState};
