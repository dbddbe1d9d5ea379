//! Task state: stage + sub-stage + failure, with progression validation.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::stage::TaskStage;
use crate::error::FerryError;

/// Sub-stage of one workflow type.
///
/// Ordering comes from the explicit `ORDER` table, not from enum declaration
/// order, so reordering a declaration cannot silently change progression
/// semantics.
pub trait SubStage:
    Copy + Eq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Total order of sub-stages, first to last.
    const ORDER: &'static [Self];

    /// Position in the total order.
    fn position(self) -> usize {
        Self::ORDER
            .iter()
            .position(|s| *s == self)
            .expect("sub-stage missing from its ORDER table")
    }

    /// The sub-stage a freshly started document enters.
    fn first() -> Self {
        Self::ORDER[0]
    }
}

/// Structured failure description carried by a FAILED document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&FerryError> for ErrorInfo {
    fn from(err: &FerryError) -> Self {
        Self::new(err.to_string())
    }
}

/// The task state of a workflow document.
///
/// Invariant: `sub_stage` is `Some` iff `stage == STARTED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct TaskState<S: SubStage> {
    pub stage: TaskStage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<S>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorInfo>,
}

impl<S: SubStage> TaskState<S> {
    pub fn created() -> Self {
        Self {
            stage: TaskStage::Created,
            sub_stage: None,
            failure: None,
        }
    }

    pub fn started(sub_stage: S) -> Self {
        Self {
            stage: TaskStage::Started,
            sub_stage: Some(sub_stage),
            failure: None,
        }
    }

    pub fn finished() -> Self {
        Self {
            stage: TaskStage::Finished,
            sub_stage: None,
            failure: None,
        }
    }

    pub fn failed(failure: ErrorInfo) -> Self {
        Self {
            stage: TaskStage::Failed,
            sub_stage: None,
            failure: Some(failure),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            stage: TaskStage::Cancelled,
            sub_stage: None,
            failure: None,
        }
    }

    /// Check the stage / sub-stage invariant.
    pub fn validate(&self) -> Result<(), FerryError> {
        match (self.stage, self.sub_stage) {
            (TaskStage::Started, None) => Err(FerryError::Validation(
                "sub-stage must be set while STARTED".to_string(),
            )),
            (stage, Some(sub)) if stage != TaskStage::Started => Err(FerryError::Validation(
                format!("sub-stage {sub:?} must be null in stage {stage}"),
            )),
            _ => Ok(()),
        }
    }

    /// Validate that `patch` does not move this state backward.
    ///
    /// - A terminal document accepts no further patches.
    /// - The patch stage rank must be >= the current stage rank.
    /// - While both states are STARTED, the patch sub-stage position must be
    ///   >= the current one (per the `ORDER` table).
    pub fn validate_progression(&self, patch: &TaskState<S>) -> Result<(), FerryError> {
        if self.stage.is_terminal() {
            return Err(FerryError::IllegalProgression(format!(
                "document is already terminal in stage {}",
                self.stage
            )));
        }
        if patch.stage.rank() < self.stage.rank() {
            return Err(FerryError::IllegalProgression(format!(
                "cannot move from stage {} back to {}",
                self.stage, patch.stage
            )));
        }
        if let (Some(current), Some(next)) = (self.sub_stage, patch.sub_stage)
            && next.position() < current.position()
        {
            return Err(FerryError::IllegalProgression(format!(
                "cannot move from sub-stage {current:?} back to {next:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    enum TestSub {
        First,
        Second,
        Third,
    }

    impl SubStage for TestSub {
        const ORDER: &'static [Self] = &[TestSub::First, TestSub::Second, TestSub::Third];
    }

    #[test]
    fn order_table_drives_positions() {
        assert_eq!(TestSub::First.position(), 0);
        assert_eq!(TestSub::Third.position(), 2);
        assert_eq!(TestSub::first(), TestSub::First);
    }

    #[rstest]
    #[case::created(TaskState::<TestSub>::created())]
    #[case::started(TaskState::started(TestSub::First))]
    #[case::finished(TaskState::<TestSub>::finished())]
    #[case::failed(TaskState::<TestSub>::failed(ErrorInfo::new("boom")))]
    #[case::cancelled(TaskState::<TestSub>::cancelled())]
    fn constructors_uphold_sub_stage_invariant(#[case] state: TaskState<TestSub>) {
        state.validate().unwrap();
        assert_eq!(
            state.sub_stage.is_some(),
            state.stage == TaskStage::Started
        );
    }

    #[test]
    fn started_without_sub_stage_is_invalid() {
        let state = TaskState::<TestSub> {
            stage: TaskStage::Started,
            sub_stage: None,
            failure: None,
        };
        assert!(matches!(
            state.validate(),
            Err(FerryError::Validation(_))
        ));
    }

    #[test]
    fn terminal_with_sub_stage_is_invalid() {
        let state = TaskState::<TestSub> {
            stage: TaskStage::Finished,
            sub_stage: Some(TestSub::Third),
            failure: None,
        };
        assert!(matches!(
            state.validate(),
            Err(FerryError::Validation(_))
        ));
    }

    #[test]
    fn forward_progression_is_accepted() {
        let current = TaskState::started(TestSub::First);
        current
            .validate_progression(&TaskState::started(TestSub::Second))
            .unwrap();
        current
            .validate_progression(&TaskState::started(TestSub::First))
            .unwrap();
        current
            .validate_progression(&TaskState::finished())
            .unwrap();
        current
            .validate_progression(&TaskState::cancelled())
            .unwrap();
    }

    #[test]
    fn backward_sub_stage_is_rejected() {
        let current = TaskState::started(TestSub::Third);
        let err = current
            .validate_progression(&TaskState::started(TestSub::First))
            .unwrap_err();
        assert!(matches!(err, FerryError::IllegalProgression(_)));
    }

    #[test]
    fn backward_stage_is_rejected() {
        let current = TaskState::started(TestSub::First);
        let err = current
            .validate_progression(&TaskState::created())
            .unwrap_err();
        assert!(matches!(err, FerryError::IllegalProgression(_)));
    }

    #[rstest]
    #[case::finished(TaskState::<TestSub>::finished())]
    #[case::failed(TaskState::<TestSub>::failed(ErrorInfo::new("boom")))]
    #[case::cancelled(TaskState::<TestSub>::cancelled())]
    fn terminal_documents_reject_all_patches(#[case] current: TaskState<TestSub>) {
        let err = current
            .validate_progression(&TaskState::finished())
            .unwrap_err();
        assert!(matches!(err, FerryError::IllegalProgression(_)));
    }
}
