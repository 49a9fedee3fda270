//! In-memory key/value store handed to every handler; updated out of band through the webhook server.

use serde_json::{Map, Value};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct KvStore {
    inner: RwLock<Map<String, Value>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    /// Write every key of `values`; returns how many keys were written.
    pub async fn merge(&self, values: Map<String, Value>) -> usize {
        let mut g = self.inner.write().await;
        let n = values.len();
        g.extend(values);
        n
    }

    /// True only when the key holds boolean `true`.
    pub async fn flag(&self, key: &str) -> bool {
        matches!(self.inner.read().await.get(key), Some(Value::Bool(true)))
    }

    pub async fn snapshot(&self) -> Map<String, Value> {
        self.inner.read().await.clone()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn merge_and_flag() {
        let kv = KvStore::new();
        let Value::Object(values) = json!({ "busy": true, "greeting": "hey" }) else {
            unreachable!()
        };
        assert_eq!(kv.merge(values).await, 2);
        assert!(kv.flag("busy").await);
        assert!(!kv.flag("greeting").await);
        assert!(!kv.flag("missing").await);

        kv.set("busy", json!("yes")).await;
        assert!(!kv.flag("busy").await);
        assert_eq!(kv.get("greeting").await, Some(json!("hey")));

        kv.clear().await;
        assert!(kv.snapshot().await.is_empty());
    }
}
