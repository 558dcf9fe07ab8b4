//! Watch registrations and change events.
//!
//! A watch is an interest in one key (exact match) or a key prefix. After
//! every commit or reload the store diffs the previous and new snapshots and
//! hands the resulting [`WatchEvent`]s to the [`WatchRegistry`], which pushes
//! a copy of each matching event down that watch's channel. Events are plain
//! values; no caller code runs while the store's lock is held.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::debug;

use crate::action::Properties;

/// Type of change that occurred to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Key did not exist before.
    New,
    /// Key existed and its value changed.
    Modified,
    /// Key was removed.
    Delete,
}

/// A change to a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// The key that changed.
    pub key: String,
    /// Type of change.
    pub event_type: EventType,
    /// Previous value (for modifications and deletes).
    pub old_value: Option<String>,
    /// New value (for new keys and modifications).
    pub new_value: Option<String>,
}

impl WatchEvent {
    /// Create a New event.
    pub fn new_key(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            event_type: EventType::New,
            old_value: None,
            new_value: Some(value.into()),
        }
    }

    /// Create a Modified event.
    pub fn modified(
        key: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            event_type: EventType::Modified,
            old_value: Some(old_value.into()),
            new_value: Some(new_value.into()),
        }
    }

    /// Create a Delete event.
    pub fn deleted(key: impl Into<String>, old_value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            event_type: EventType::Delete,
            old_value: Some(old_value.into()),
            new_value: None,
        }
    }
}

/// Compute the per-key changes between two snapshots, in key order.
///
/// Keys whose value is unchanged produce no event.
pub fn diff(before: &Properties, after: &Properties) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (key, new) in after {
        match before.get(key) {
            None => events.push(WatchEvent::new_key(key, new)),
            Some(old) if old != new => events.push(WatchEvent::modified(key, old, new)),
            Some(_) => {}
        }
    }
    for (key, old) in before {
        if !after.contains_key(key) {
            events.push(WatchEvent::deleted(key, old));
        }
    }
    events.sort_by(|a, b| a.key.cmp(&b.key));
    events
}

/// Opaque handle identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// How a watch target is compared with changed keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    /// The key must equal the target.
    Exact,
    /// The key must start with the target.
    Prefix,
}

impl MatchMode {
    /// Check if `key` is covered by `target` under this mode.
    pub fn matches(self, target: &str, key: &str) -> bool {
        match self {
            MatchMode::Exact => key == target,
            MatchMode::Prefix => key.starts_with(target),
        }
    }
}

/// A stream of events for one registration.
///
/// Ends when the watch is cancelled or the store is dropped.
pub struct WatchStream {
    receiver: mpsc::UnboundedReceiver<WatchEvent>,
    target: String,
    mode: MatchMode,
}

impl WatchStream {
    /// The key or prefix this stream is watching.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Receives events for a callback-style watch.
pub trait WatchCallback: Send + 'static {
    fn on_event(&mut self, event: WatchEvent);
}

impl<F> WatchCallback for F
where
    F: FnMut(WatchEvent) + Send + 'static,
{
    fn on_event(&mut self, event: WatchEvent) {
        self(event)
    }
}

/// Drive `callback` from `stream` on the given runtime until the watch ends.
pub(crate) fn spawn_callback(
    runtime: &Handle,
    mut stream: WatchStream,
    mut callback: Box<dyn WatchCallback>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        while let Some(event) = stream.recv().await {
            callback.on_event(event);
        }
    })
}

struct Watch {
    target: String,
    mode: MatchMode,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

/// Live watch registrations, keyed by handle.
#[derive(Default)]
pub struct WatchRegistry {
    next_id: u64,
    watches: HashMap<WatchId, Watch>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `target` and return the handle and event stream.
    pub fn register(
        &mut self,
        target: impl Into<String>,
        mode: MatchMode,
    ) -> (WatchId, WatchStream) {
        let target = target.into();
        self.next_id += 1;
        let id = WatchId(self.next_id);
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(%id, target = %target, ?mode, "watch registered");
        self.watches.insert(
            id,
            Watch {
                target: target.clone(),
                mode,
                sender,
            },
        );
        (
            id,
            WatchStream {
                receiver,
                target,
                mode,
            },
        )
    }

    /// Cancel a registration. Returns false if the handle was unknown.
    pub fn remove(&mut self, id: WatchId) -> bool {
        let removed = self.watches.remove(&id).is_some();
        if removed {
            debug!(%id, "watch removed");
        }
        removed
    }

    /// Deliver each event to every matching watch.
    ///
    /// Registrations whose stream has been dropped are pruned.
    pub fn dispatch(&mut self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        self.watches.retain(|id, watch| {
            for event in events {
                if watch.mode.matches(&watch.target, &event.key)
                    && watch.sender.send(event.clone()).is_err()
                {
                    debug!(%id, "watch receiver dropped");
                    return false;
                }
            }
            true
        });
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_event_type_serialize() {
        let json = serde_json::to_string(&EventType::Modified).unwrap();
        assert_eq!(json, "\"MODIFIED\"");
    }

    #[test]
    fn test_diff_kinds() {
        let before = props(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let after = props(&[("a", "1"), ("b", "20"), ("d", "4")]);

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                WatchEvent::modified("b", "2", "20"),
                WatchEvent::deleted("c", "3"),
                WatchEvent::new_key("d", "4"),
            ]
        );
    }

    #[test]
    fn test_diff_unchanged_is_silent() {
        let snapshot = props(&[("a", "1")]);
        assert!(diff(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_pattern_matching() {
        assert!(MatchMode::Prefix.matches("a.b", "a.b.c"));
        assert!(MatchMode::Prefix.matches("a.b", "a.b"));
        assert!(!MatchMode::Prefix.matches("a.b", "x.a.b"));
        assert!(MatchMode::Exact.matches("a.b", "a.b"));
        assert!(!MatchMode::Exact.matches("a.b", "a.b.c"));
    }

    #[test]
    fn test_dispatch_routes_to_matching_watches() {
        let mut registry = WatchRegistry::new();
        let (_, mut prefix) = registry.register("a.b", MatchMode::Prefix);
        let (_, mut exact) = registry.register("a.b.c", MatchMode::Exact);
        let (_, mut other) = registry.register("z", MatchMode::Prefix);

        registry.dispatch(&[
            WatchEvent::new_key("a.b.c", "1"),
            WatchEvent::new_key("a.b.d", "2"),
        ]);

        assert_eq!(prefix.try_recv().unwrap().key, "a.b.c");
        assert_eq!(prefix.try_recv().unwrap().key, "a.b.d");
        assert!(prefix.try_recv().is_none());
        assert_eq!(exact.try_recv().unwrap().key, "a.b.c");
        assert!(exact.try_recv().is_none());
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn test_remove_closes_stream() {
        let mut registry = WatchRegistry::new();
        let (id, mut stream) = registry.register("k", MatchMode::Exact);
        assert_ne!(id, registry.register("k", MatchMode::Exact).0);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.len(), 1);
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_dropped_stream_is_pruned() {
        let mut registry = WatchRegistry::new();
        let (_, stream) = registry.register("k", MatchMode::Exact);
        drop(stream);
        registry.dispatch(&[WatchEvent::new_key("k", "v")]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_callback_receives_events() {
        let mut registry = WatchRegistry::new();
        let (id, stream) = registry.register("k", MatchMode::Exact);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_callback(
            &Handle::current(),
            stream,
            Box::new(move |event: WatchEvent| {
                let _ = tx.send(event);
            }),
        );

        registry.dispatch(&[WatchEvent::new_key("k", "v")]);
        assert_eq!(rx.recv().await.unwrap(), WatchEvent::new_key("k", "v"));

        registry.remove(id);
        task.await.unwrap();
    }
}
