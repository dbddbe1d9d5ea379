//! Top-level task lifecycle stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a task document.
///
/// Stage transitions:
/// - Created -> Started -> Finished
/// - Created -> Started -> Failed
/// - Created -> Started -> Cancelled
///
/// Serialized as SCREAMING_SNAKE_CASE to match the wire names other task
/// services use (CREATED / STARTED / FINISHED / FAILED / CANCELLED).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    /// Accepted but not yet processing.
    Created,

    /// Actively processing; the only stage that carries a sub-stage.
    Started,

    /// Completed successfully.
    Finished,

    /// Terminated with a failure.
    Failed,

    /// Terminated by a cancellation request.
    Cancelled,
}

impl TaskStage {
    /// Is this a terminal stage (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStage::Finished | TaskStage::Failed | TaskStage::Cancelled
        )
    }

    /// Coarse rank used by monotonic progression checks.
    ///
    /// Terminal stages share one rank: a document may move from STARTED to any
    /// of them, but never from one terminal stage to another.
    pub fn rank(self) -> u8 {
        match self {
            TaskStage::Created => 0,
            TaskStage::Started => 1,
            TaskStage::Finished | TaskStage::Failed | TaskStage::Cancelled => 2,
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStage::Created => "CREATED",
            TaskStage::Started => "STARTED",
            TaskStage::Finished => "FINISHED",
            TaskStage::Failed => "FAILED",
            TaskStage::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn stages_serialize_as_wire_names() {
        let s = serde_json::to_string(&TaskStage::Created).unwrap();
        assert_eq!(s, "\"CREATED\"");

        let s = serde_json::to_string(&TaskStage::Cancelled).unwrap();
        assert_eq!(s, "\"CANCELLED\"");
    }

    #[rstest]
    #[case::created(TaskStage::Created, false)]
    #[case::started(TaskStage::Started, false)]
    #[case::finished(TaskStage::Finished, true)]
    #[case::failed(TaskStage::Failed, true)]
    #[case::cancelled(TaskStage::Cancelled, true)]
    fn terminal_stages(#[case] stage: TaskStage, #[case] terminal: bool) {
        assert_eq!(stage.is_terminal(), terminal);
    }

    #[test]
    fn rank_orders_lifecycle() {
        assert!(TaskStage::Created.rank() < TaskStage::Started.rank());
        assert!(TaskStage::Started.rank() < TaskStage::Finished.rank());
        assert_eq!(TaskStage::Failed.rank(), TaskStage::Cancelled.rank());
    }
}
