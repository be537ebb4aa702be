//! Namespaced key-value store handed to graphs.
//!
//! Graphs use this for long-lived memory that outlives a single checkpoint.
//! The core only plumbs it through; the in-memory implementation lives in
//! graphd-stores.

use async_trait::async_trait;
use serde_json::Value;

use crate::store::StoreError;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<(), StoreError>;

    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError>;

    /// List keys under a namespace.
    async fn list(&self, namespace: &[String]) -> Result<Vec<String>, StoreError>;
}
