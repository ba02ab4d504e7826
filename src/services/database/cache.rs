//! Per-connection schema cache.
//!
//! Concurrent fetches for the same connection id share one introspection
//! run. Failed fetches leave nothing behind.

use async_lock::{Mutex, OnceCell};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::types::DatabaseSchema;

type Entry = Arc<OnceCell<Arc<DatabaseSchema>>>;

#[derive(Default)]
pub struct SchemaCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<DatabaseSchema>> {
        let entries = self.entries.lock().await;
        entries
            .get(connection_id)
            .and_then(|entry| entry.get())
            .cloned()
    }

    /// Return the cached schema or build it with `fetch`.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        connection_id: &str,
        fetch: F,
    ) -> Result<Arc<DatabaseSchema>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DatabaseSchema, E>>,
    {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(connection_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = entry
            .get_or_try_init(|| async move { fetch().await.map(Arc::new) })
            .await
            .cloned();

        if result.is_err() {
            let mut entries = self.entries.lock().await;
            let is_same_empty = entries
                .get(connection_id)
                .is_some_and(|current| Arc::ptr_eq(current, &entry) && current.get().is_none());
            if is_same_empty {
                entries.remove(connection_id);
            }
        }

        result
    }

    pub async fn evict(&self, connection_id: &str) {
        self.entries.lock().await.remove(connection_id);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::types::TableEntity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn schema_with(table: &str) -> DatabaseSchema {
        DatabaseSchema {
            tables: vec![TableEntity {
                name: table.to_string(),
                columns: vec![],
                indexes: vec![],
                foreign_keys: vec![],
            }],
            relationships: vec![],
        }
    }

    #[test]
    fn test_concurrent_fetches_run_once() {
        smol::block_on(async {
            let cache = SchemaCache::new();
            let counter = AtomicUsize::new(0);
            let runs = &counter;
            let fetch = move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                smol::Timer::after(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(schema_with("users"))
            };

            let (a, b) = futures::join!(cache.get_or_fetch("c1", fetch), cache.get_or_fetch("c1", fetch));
            assert_eq!(a.unwrap(), b.unwrap());
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_failed_fetch_is_not_cached() {
        smol::block_on(async {
            let cache = SchemaCache::new();
            let err = cache
                .get_or_fetch("c1", || async { Err::<DatabaseSchema, _>("denied") })
                .await;
            assert_eq!(err.unwrap_err(), "denied");
            assert!(cache.get("c1").await.is_none());
            assert!(cache.entries.lock().await.is_empty());

            let schema = cache
                .get_or_fetch("c1", || async { Ok::<_, &str>(schema_with("orders")) })
                .await
                .unwrap();
            assert!(schema.table("orders").is_some());
        });
    }

    #[test]
    fn test_evict_forces_refetch() {
        smol::block_on(async {
            let cache = SchemaCache::new();
            cache
                .get_or_fetch("c1", || async { Ok::<_, ()>(schema_with("old")) })
                .await
                .unwrap();
            cache.evict("c1").await;
            let schema = cache
                .get_or_fetch("c1", || async { Ok::<_, ()>(schema_with("new")) })
                .await
                .unwrap();
            assert!(schema.table("new").is_some());
        });
    }
}
