//! In-memory implementation of the namespaced key-value store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use graphd_core::kv::KvStore;
use graphd_core::store::StoreError;

#[derive(Default)]
pub struct InMemoryKvStore {
    inner: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace_key(namespace: &[String]) -> String {
        namespace.join("/")
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(&Self::namespace_key(namespace))
            .and_then(|bucket| bucket.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .entry(Self::namespace_key(namespace))
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(bucket) = inner.get_mut(&Self::namespace_key(namespace)) {
            bucket.remove(key);
            if bucket.is_empty() {
                inner.remove(&Self::namespace_key(namespace));
            }
        }
        Ok(())
    }

    async fn list(&self, namespace: &[String]) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .get(&Self::namespace_key(namespace))
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_delete_round_trip() {
        tokio_test::block_on(async {
            let store = InMemoryKvStore::new();
            let ns = vec!["memories".to_string(), "user-1".to_string()];

            store.put(&ns, "likes", json!("rust")).await.unwrap();
            assert_eq!(store.get(&ns, "likes").await.unwrap(), Some(json!("rust")));
            assert_eq!(store.list(&ns).await.unwrap(), vec!["likes".to_string()]);

            store.delete(&ns, "likes").await.unwrap();
            assert_eq!(store.get(&ns, "likes").await.unwrap(), None);
        });
    }

    #[test]
    fn test_namespaces_are_isolated() {
        tokio_test::block_on(async {
            let store = InMemoryKvStore::new();
            let a = vec!["a".to_string()];
            let b = vec!["b".to_string()];
            store.put(&a, "k", json!(1)).await.unwrap();
            assert_eq!(store.get(&b, "k").await.unwrap(), None);
        });
    }
}
