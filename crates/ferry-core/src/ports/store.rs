//! DocumentStore port: the replicated document store contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FerryError;
use crate::query::{QueryResult, QuerySpec};

/// The replicated document store, as consumed by the engine.
///
/// The store persists documents, replicates them across nodes, and guarantees
/// that at most one replica owns write-processing for a document at a time.
/// Ferry only consumes this contract; `impls::InMemoryDocumentStore` provides
/// a development implementation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document at a factory. Returns the new document's self-link.
    async fn create(&self, factory_link: &str, body: Value) -> Result<String, FerryError>;

    /// Fetch a document body.
    async fn get(&self, self_link: &str) -> Result<Value, FerryError>;

    /// Merge a partial body into a document. Returns the merged state.
    async fn patch(&self, self_link: &str, patch: Value) -> Result<Value, FerryError>;

    /// Delete a document.
    async fn delete(&self, self_link: &str) -> Result<(), FerryError>;

    /// Owner write of a full document body (upsert).
    async fn put(&self, self_link: &str, kind: &str, body: Value) -> Result<(), FerryError>;

    /// Fan a query out to every replica of the index and return each
    /// replica's local result set. Fails as a whole if any replica fails;
    /// callers merge with [`crate::query::merge_replica_results`].
    async fn broadcast_query(
        &self,
        query: &QuerySpec,
    ) -> Result<Vec<Vec<QueryResult>>, FerryError>;
}
