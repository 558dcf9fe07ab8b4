//! PropertyStore trait - the key-value capability every backend provides.
//!
//! Keys are opaque dotted strings (`framework.run.U123.status`). The first
//! dotted segment of a key is its namespace. Callers that want a private
//! area layer a prefix on top (see [`crate::namespace::NamespacedStore`]);
//! the store itself never rewrites keys.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::action::Action;
use crate::error::{Result, StoreError};
use crate::watch::{WatchCallback, WatchId};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Separator between key segments.
pub const KEY_SEPARATOR: char = '.';

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// The namespace of a key: everything before the first separator.
pub fn namespace_of(key: &str) -> &str {
    key.split(KEY_SEPARATOR).next().unwrap_or(key)
}

/// The property store capability.
///
/// Every mutation is atomic: either all of its changes become visible to
/// later reads and to watchers, or none do.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Get the value of a key, or `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Get every property whose key starts with `prefix`.
    ///
    /// No match is an empty map, not an error.
    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// The distinct first segments of all keys.
    async fn get_namespaces(&self) -> Result<BTreeSet<String>> {
        let all = self.get_prefix("").await?;
        Ok(all.keys().map(|k| namespace_of(k).to_string()).collect())
    }

    /// Set a key to a value unconditionally.
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.perform_actions(vec![Action::update(key, value)]).await
    }

    /// Set many keys in one transaction.
    async fn put_all(&self, properties: BTreeMap<String, String>) -> Result<()> {
        let actions = properties
            .into_iter()
            .map(|(k, v)| Action::update(k, v))
            .collect();
        self.perform_actions(actions).await
    }

    /// Set `key` to `new_value` only if it currently holds `old_value`.
    ///
    /// `old_value: None` means the key must not exist. Returns whether the
    /// swap happened; a mismatch is not an error.
    async fn put_swap(&self, key: &str, old_value: Option<&str>, new_value: &str) -> Result<bool> {
        self.put_swap_with_others(key, old_value, new_value, BTreeMap::new())
            .await
    }

    /// Swap one key and, only if the swap succeeds, write `others` with it.
    async fn put_swap_with_others(
        &self,
        key: &str,
        old_value: Option<&str>,
        new_value: &str,
        others: BTreeMap<String, String>,
    ) -> Result<bool> {
        let mut actions = vec![Action::swap(key, old_value, new_value)];
        actions.extend(others.into_iter().map(|(k, v)| Action::update(k, v)));
        match self.perform_actions(actions).await {
            Ok(()) => Ok(true),
            Err(StoreError::Precondition(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Apply a batch of actions atomically.
    ///
    /// Fails with [`StoreError::Precondition`] and leaves the store unchanged
    /// if any action's expectation does not hold.
    async fn perform_actions(&self, actions: Vec<Action>) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()> {
        self.perform_actions(vec![Action::delete(key)]).await
    }

    /// Delete many keys in one transaction.
    async fn delete_all(&self, keys: BTreeSet<String>) -> Result<()> {
        self.perform_actions(keys.into_iter().map(Action::delete).collect())
            .await
    }

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.perform_actions(vec![Action::delete_prefix(prefix)])
            .await
    }

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Get a value and deserialize it as JSON.
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>>
    where
        Self: Sized,
    {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Set a key to a JSON-encoded value.
    async fn put_json<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        let encoded = serde_json::to_string(value)?;
        self.put(key, &encoded).await
    }

    /// Call `callback` for every change to exactly `key`.
    fn watch(&self, key: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId>;

    /// Call `callback` for every change to a key starting with `prefix`.
    fn watch_prefix(&self, prefix: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId>;

    /// Cancel a watch. Unknown handles are ignored.
    fn unwatch(&self, id: WatchId) -> Result<()>;
}

#[async_trait]
impl<S: PropertyStore + ?Sized> PropertyStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        (**self).get_prefix(prefix).await
    }

    async fn perform_actions(&self, actions: Vec<Action>) -> Result<()> {
        (**self).perform_actions(actions).await
    }

    fn watch(&self, key: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        (**self).watch(key, callback)
    }

    fn watch_prefix(&self, prefix: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        (**self).watch_prefix(prefix, callback)
    }

    fn unwatch(&self, id: WatchId) -> Result<()> {
        (**self).unwatch(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_valid() {
        assert!(validate_key("framework.run.U1").is_ok());
        assert!(validate_key("a").is_ok());
    }

    #[test]
    fn test_validate_key_empty() {
        let err = validate_key("").unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[test]
    fn test_validate_key_too_long() {
        let key = "a".repeat(MAX_KEY_LENGTH + 1);
        let err = validate_key(&key).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[test]
    fn test_namespace_of() {
        assert_eq!(namespace_of("framework.run.U1"), "framework");
        assert_eq!(namespace_of("plain"), "plain");
        assert_eq!(namespace_of(".leading"), "");
    }
}
