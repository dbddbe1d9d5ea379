//! ferry-core
//!
//! Core building blocks for the Ferry migration orchestrator: a durable,
//! replicated workflow engine that drives a multi-phase cluster migration.
//!
//! # Module layout
//! - **domain**: task lifecycle model (stages, sub-stages, task state, patch
//!   documents)
//! - **ports**: abstraction layer over the replicated document store
//! - **query**: broadcast query predicates and replica result merging
//! - **engine**: the generic machinery (per-document driver loop, child task
//!   launcher, fan-out coordinator, polling wait)
//! - **workflow**: the migration workflow built on top of the engine
//! - **impls**: in-memory implementations for development and tests

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod impls;
pub mod ports;
pub mod query;
pub mod workflow;
