use std::time::Duration;

use thiserror::Error;

/// Ferry's error taxonomy.
///
/// - `Validation` / `IllegalProgression`: rejected synchronously, document
///   state unchanged.
/// - `Transport`: a failed network round-trip; always converted into a FAILED
///   self-patch by the engine.
/// - `ChildCancelled` / `ChildFailed` / `UnexpectedChildStage`: a launched
///   child reached a terminal state other than FINISHED.
/// - `Aggregate`: multiple concurrent children failed; every individual error
///   is preserved.
#[derive(Debug, Error)]
pub enum FerryError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("illegal stage progression: {0}")]
    IllegalProgression(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("child task cancelled: {0}")]
    ChildCancelled(String),

    #[error("child task failed: {0}")]
    ChildFailed(String),

    #[error("unexpected stage [{stage}] for child task {link}")]
    UnexpectedChildStage { stage: String, link: String },

    #[error("poll deadline of {0:?} exceeded")]
    PollDeadline(Duration),

    #[error("{} error(s): [{}]", .0.len(), aggregate_messages(.0))]
    Aggregate(Vec<FerryError>),

    #[error("{0}")]
    Other(String),
}

fn aggregate_messages(errors: &[FerryError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
