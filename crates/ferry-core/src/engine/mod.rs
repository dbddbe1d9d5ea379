//! Engine: the generic machinery every workflow is built from.
//!
//! - **workflow**: the `Workflow` trait and the context handed to sub-stage
//!   handlers
//! - **driver**: the per-document driver loop (serialized operations,
//!   self-patch intent queue)
//! - **launch**: the child task launcher (create, poll to terminal, resolve
//!   exactly once)
//! - **fanout**: fan-out/fan-in with partial-failure aggregation
//! - **poll**: polling wait over broadcast query results

pub mod driver;
pub mod fanout;
pub mod launch;
pub mod poll;
pub mod workflow;

pub use driver::{DocumentDriver, DriverHandle};
pub use fanout::join_all_collecting;
pub use launch::start_task_and_await;
pub use poll::PollingWait;
pub use workflow::{Workflow, WorkflowContext};
