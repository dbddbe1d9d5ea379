//! In-memory implementations of the ports, for development and tests.

pub mod inmem_store;

pub use inmem_store::{ChildScript, InMemoryDocumentStore};
