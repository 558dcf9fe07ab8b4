//! Prefix-scoped views over a property store.
//!
//! A [`NamespacedStore`] gives one component a private area of a shared
//! store. Keys passed in are prefixed, keys handed back (including those in
//! watch events) have the prefix stripped, and actions are rewritten with
//! [`Action::with_prefix`].

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::action::Action;
use crate::error::Result;
use crate::store::{validate_key, PropertyStore, KEY_SEPARATOR};
use crate::watch::{WatchCallback, WatchEvent, WatchId};

/// First segment of every dynamic status key.
pub const DYNAMIC_STATUS_ROOT: &str = "dss";

/// A view of `inner` restricted to keys under one prefix.
#[derive(Debug, Clone)]
pub struct NamespacedStore<S> {
    inner: S,
    prefix: String,
}

impl<S: PropertyStore> NamespacedStore<S> {
    /// View the keys under `<namespace>.`.
    pub fn new(inner: S, namespace: &str) -> Self {
        Self {
            inner,
            prefix: format!("{namespace}{KEY_SEPARATOR}"),
        }
    }

    /// View the dynamic status area of `namespace` (`dss.<namespace>.`).
    ///
    /// Resource ownership records live here.
    pub fn dynamic_status(inner: S, namespace: &str) -> Self {
        Self {
            inner,
            prefix: format!("{DYNAMIC_STATUS_ROOT}{KEY_SEPARATOR}{namespace}{KEY_SEPARATOR}"),
        }
    }

    /// The prefix applied to every key.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn full_key(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }

    fn strip(&self, props: BTreeMap<String, String>) -> BTreeMap<String, String> {
        props
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&self.prefix).map(|k| (k.to_string(), v)))
            .collect()
    }

    fn stripping(&self, mut callback: Box<dyn WatchCallback>) -> Box<dyn WatchCallback> {
        let prefix = self.prefix.clone();
        Box::new(move |mut event: WatchEvent| {
            if let Some(local) = event.key.strip_prefix(&prefix) {
                event.key = local.to_string();
            }
            callback.on_event(event);
        })
    }
}

#[async_trait]
impl<S: PropertyStore> PropertyStore for NamespacedStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.full_key(key)?;
        self.inner.get(&key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let found = self
            .inner
            .get_prefix(&format!("{}{}", self.prefix, prefix))
            .await?;
        Ok(self.strip(found))
    }

    async fn perform_actions(&self, actions: Vec<Action>) -> Result<()> {
        let actions = actions
            .iter()
            .map(|action| action.with_prefix(&self.prefix))
            .collect();
        self.inner.perform_actions(actions).await
    }

    fn watch(&self, key: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        let key = self.full_key(key)?;
        self.inner.watch(&key, self.stripping(callback))
    }

    fn watch_prefix(&self, prefix: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        self.inner.watch_prefix(
            &format!("{}{}", self.prefix, prefix),
            self.stripping(callback),
        )
    }

    fn unwatch(&self, id: WatchId) -> Result<()> {
        self.inner.unwatch(id)
    }
}
