//! In-memory property store.
//!
//! Same transaction and watch semantics as
//! [`PropertyFileStore`](crate::property_file::PropertyFileStore) without a
//! backing file. Data is lost when the store is dropped; use for tests and
//! for callers that only need in-process coordination.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::action::{apply_all, Action, Properties};
use crate::error::{Result, StoreError};
use crate::store::{validate_key, PropertyStore};
use crate::watch::{
    diff, spawn_callback, MatchMode, WatchCallback, WatchId, WatchRegistry, WatchStream,
};

/// In-memory implementation of PropertyStore.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    props: Properties,
    watches: WatchRegistry,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `props`.
    pub fn with_properties(props: BTreeMap<String, String>) -> Self {
        Self {
            state: Mutex::new(State {
                props,
                watches: WatchRegistry::new(),
            }),
        }
    }

    /// Get the number of properties in the store.
    pub fn len(&self) -> usize {
        self.state.lock().props.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().props.is_empty()
    }

    /// Register a watch and receive its events as a stream.
    pub fn subscribe(&self, target: &str, mode: MatchMode) -> (WatchId, WatchStream) {
        self.state.lock().watches.register(target, mode)
    }

    fn register_callback(
        &self,
        target: &str,
        mode: MatchMode,
        callback: Box<dyn WatchCallback>,
    ) -> Result<WatchId> {
        if mode == MatchMode::Exact {
            validate_key(target)?;
        }
        let runtime = Handle::try_current().map_err(|e| StoreError::Runtime(e.to_string()))?;
        let (id, stream) = self.subscribe(target, mode);
        spawn_callback(&runtime, stream, callback);
        Ok(id)
    }
}

#[async_trait]
impl PropertyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.state.lock().props.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let state = self.state.lock();
        Ok(state
            .props
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn perform_actions(&self, actions: Vec<Action>) -> Result<()> {
        let mut state = self.state.lock();
        let after = apply_all(&state.props, &actions)?;
        let events = diff(&state.props, &after);
        state.props = after;
        state.watches.dispatch(&events);
        Ok(())
    }

    fn watch(&self, key: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        self.register_callback(key, MatchMode::Exact, callback)
    }

    fn watch_prefix(&self, prefix: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        self.register_callback(prefix, MatchMode::Prefix, callback)
    }

    fn unwatch(&self, id: WatchId) -> Result<()> {
        self.state.lock().watches.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{EventType, WatchEvent};

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStore::new();

        store.put("test.key", "value").await.unwrap();
        assert_eq!(store.get("test.key").await.unwrap().as_deref(), Some("value"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = MemoryStore::new();
        assert!(store.get("nonexistent").await.unwrap().is_none());
        assert!(store.get_prefix("none.").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_nonexistent() {
        let store = MemoryStore::new();
        // Should not error
        store.delete("nonexistent").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_put_swap_conflict() {
        let store = MemoryStore::new();
        store.put("key", "v1").await.unwrap();

        assert!(!store.put_swap("key", Some("v0"), "v2").await.unwrap());
        assert!(!store.put_swap("key", None, "v2").await.unwrap());
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_transaction_conflict() {
        let store = MemoryStore::new();
        store.put("a", "1").await.unwrap();

        let result = store
            .perform_actions(vec![
                Action::update("b", "2"),
                Action::delete_if("a", "wrong"),
            ])
            .await;

        assert!(matches!(result, Err(StoreError::Precondition(_))));
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(!store.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_json_operations() {
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct RunStatus {
            name: String,
            attempt: i32,
        }

        let store = MemoryStore::new();
        let status = RunStatus {
            name: "U42".to_string(),
            attempt: 2,
        };

        store.put_json("run.U42", &status).await.unwrap();
        let loaded: RunStatus = store.get_json("run.U42").await.unwrap().unwrap();
        assert_eq!(status, loaded);
    }

    #[tokio::test]
    async fn test_watch_events() {
        let store = MemoryStore::new();
        let (id, mut stream) = store.subscribe("a.b", MatchMode::Prefix);

        store.put("a.b.c", "1").await.unwrap();
        store.put("a.b.c", "2").await.unwrap();
        store.delete_prefix("a.").await.unwrap();

        let kinds: Vec<EventType> = std::iter::from_fn(|| stream.try_recv())
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![EventType::New, EventType::Modified, EventType::Delete]
        );

        store.unwatch(id).unwrap();
        store.put("a.b.c", "3").await.unwrap();
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_callback_needs_runtime() {
        let store = MemoryStore::new();
        let err = store
            .watch("k", Box::new(|_event: WatchEvent| {}))
            .unwrap_err();
        assert!(matches!(err, StoreError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_stores_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<MemoryStore>();
        assert_send_sync::<crate::PropertyFileStore>();
    }
}
