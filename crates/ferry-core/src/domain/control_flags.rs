//! Control flags carried by workflow documents.

/// Disables self-driving of a document, making its instance a passive
/// listener. Set only by test harnesses.
pub const DISABLE_OPERATION_PROCESSING: u32 = 1 << 0;

pub fn is_operation_processing_disabled(flags: u32) -> bool {
    flags & DISABLE_OPERATION_PROCESSING != 0
}
