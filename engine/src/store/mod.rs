//! Document store collaborator
//!
//! The engine talks to the record store through [`DocumentStore`]. Every
//! query carries a filter document, an aggregation pipeline and a row limit.
//! Code-executing operators are rejected before submission.
//!
//! [`InMemoryDocumentStore`] evaluates queries over fixture collections and
//! backs the CLI and the test suite.

pub mod fixtures;
pub mod pipeline;
pub mod value;

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Row;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub use pipeline::{referenced_collections, validate_filter, validate_pipeline};

/// One read against a collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreQuery {
    pub filter: Map<String, Value>,
    pub pipeline: Vec<Value>,
    pub limit: u32,
}

impl StoreQuery {
    /// Reject forbidden operators in the filter or pipeline
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_filter(&self.filter)?;
        validate_pipeline(&self.pipeline)
    }
}

/// Filtered and aggregated reads over named collections
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Name used in logs and error messages
    fn name(&self) -> &str {
        "document_store"
    }

    /// Ordered rows of `collection` matching `query`, at most `query.limit`
    async fn query(&self, collection: &str, query: &StoreQuery) -> Result<Vec<Row>, EngineError>;
}

/// Document store over in-process collections
pub struct InMemoryDocumentStore {
    collections: HashMap<String, Vec<Row>>,
}

impl InMemoryDocumentStore {
    pub fn new(collections: HashMap<String, Vec<Row>>) -> Self {
        Self { collections }
    }

    /// Store seeded with the demo dataset
    pub fn demo() -> Self {
        Self::new(fixtures::demo_collections(chrono::Utc::now()))
    }

    /// Store seeded from a JSON fixture file
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        Ok(Self::new(fixtures::load_fixtures(path)?))
    }

    fn documents(&self, collection: &str) -> Vec<Row> {
        self.collections.get(collection).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &str {
        "in_memory_store"
    }

    async fn query(&self, collection: &str, query: &StoreQuery) -> Result<Vec<Row>, EngineError> {
        query.validate()?;

        let docs = self.documents(collection);
        let total = docs.len();
        let mut rows = pipeline::filter_docs(docs, &query.filter)?;
        rows = pipeline::run_pipeline(rows, &query.pipeline, &|name: &str| self.documents(name))?;
        rows.truncate(query.limit as usize);

        debug!(
            "Store query on {}: {} of {} documents (limit {})",
            collection,
            rows.len(),
            total,
            query.limit
        );
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(filter: Value, pipeline: Vec<Value>, limit: u32) -> StoreQuery {
        StoreQuery {
            filter: filter.as_object().cloned().unwrap_or_default(),
            pipeline,
            limit,
        }
    }

    #[tokio::test]
    async fn test_filter_on_demo_leads() {
        let store = InMemoryDocumentStore::demo();
        let rows = store
            .query("leads", &query(json!({"status": "Qualified"}), vec![], 1000))
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r["status"] == "Qualified"));
    }

    #[tokio::test]
    async fn test_limit_is_applied() {
        let store = InMemoryDocumentStore::demo();
        let rows = store.query("leads", &query(json!({}), vec![], 4)).await.unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_empty() {
        let store = InMemoryDocumentStore::demo();
        let rows = store.query("invoices", &query(json!({}), vec![], 10)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_operator_never_runs() {
        let store = InMemoryDocumentStore::demo();
        let q = query(json!({"$where": "this.amount > 0"}), vec![], 10);
        let err = store.query("leads", &q).await.unwrap_err();
        assert!(matches!(err, EngineError::ForbiddenOperator(_)));
    }

    #[tokio::test]
    async fn test_pipeline_group_by_owner() {
        let store = InMemoryDocumentStore::demo();
        let pipeline = vec![
            json!({"$group": {"_id": "$owner", "pipeline": {"$sum": "$amount"}}}),
            json!({"$sort": {"_id": 1}}),
        ];
        let rows = store.query("leads", &query(json!({}), pipeline, 100)).await.unwrap();
        let owners: Vec<&str> = rows.iter().filter_map(|r| r["_id"].as_str()).collect();
        assert_eq!(owners, vec!["Aryan", "Priya", "Sneha"]);
    }
}
