//! Ports: abstraction layer over external collaborators.

pub mod store;

pub use store::DocumentStore;
