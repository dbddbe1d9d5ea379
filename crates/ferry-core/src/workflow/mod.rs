//! The migration workflow and the document types it collaborates with.

pub mod documents;
pub mod migration;

pub use migration::{
    EntityKindMapping, MigrationContext, MigrationState, MigrationSubStage, MigrationWorkflow,
};
