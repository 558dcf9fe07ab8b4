//! File-backed property store.
//!
//! The store keeps an in-memory snapshot of a single `key=value` file that
//! may be shared with other processes. Every call reconciles the snapshot
//! with the file before trusting it:
//!
//! - reads take a shared lock and reload only if the file's fingerprint moved
//! - mutations take an exclusive lock, always reload, apply their actions to
//!   a copy, rewrite the whole file and only then replace the snapshot
//!
//! Any difference found, whether from a reload or from our own commit, is
//! diffed into [`WatchEvent`](crate::watch::WatchEvent)s and pushed to
//! matching watches. While at least one watch is registered a background task
//! re-checks the file every `poll_interval` so edits by other processes are
//! reported without this process touching the store.
//!
//! Within one process all of this is serialized by one mutex. Across
//! processes only the file lock applies; the store is best-effort there and
//! not a replacement for a consensus service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::action::{apply_all, Action, Properties};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::file::{BackingFile, Fingerprint, LockMode, LockedFile};
use crate::store::{validate_key, PropertyStore};
use crate::watch::{
    diff, spawn_callback, MatchMode, WatchCallback, WatchEvent, WatchId, WatchRegistry,
    WatchStream,
};

/// Default interval between background checks for external edits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Property store persisted in a shared text file.
///
/// Cloning is cheap and yields another handle on the same store.
#[derive(Clone)]
pub struct PropertyFileStore {
    shared: Arc<Shared>,
}

struct Shared {
    file: BackingFile,
    state: Mutex<State>,
    runtime: Handle,
    poll_interval: Duration,
}

struct State {
    snapshot: Properties,
    fingerprint: Option<Fingerprint>,
    watches: WatchRegistry,
    poller: Option<JoinHandle<()>>,
}

impl State {
    /// Deliver events, then stop polling once no watch is left to notify.
    fn dispatch(&mut self, events: &[WatchEvent]) {
        self.watches.dispatch(events);
        self.stop_poller_if_idle();
    }

    fn stop_poller_if_idle(&mut self) {
        if !self.watches.is_empty() {
            return;
        }
        if let Some(poller) = self.poller.take() {
            debug!("stopping change poller");
            poller.abort();
        }
    }
}

impl PropertyFileStore {
    /// Open or create the store described by `config`.
    ///
    /// Must be called from within a tokio runtime; that runtime drives the
    /// poller and watch callbacks.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| StoreError::Runtime(e.to_string()))?;
        let shared = Arc::new(Shared {
            file: BackingFile::new(&config.path, config.lock_timeout()),
            state: Mutex::new(State {
                snapshot: Properties::new(),
                fingerprint: None,
                watches: WatchRegistry::new(),
                poller: None,
            }),
            runtime,
            poll_interval: config.poll_interval(),
        });

        let loader = Arc::clone(&shared);
        let count = tokio::task::spawn_blocking(move || loader.read(|props| props.len())).await??;
        info!(
            path = %config.path.display(),
            properties = count,
            "Opened property file store"
        );

        Ok(Self { shared })
    }

    /// Open a store at `path` with default settings.
    pub async fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(&StoreConfig::new(path)).await
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        self.shared.file.path()
    }

    /// Register a watch and receive its events as a stream.
    pub fn subscribe(&self, target: &str, mode: MatchMode) -> (WatchId, WatchStream) {
        let mut state = self.shared.state.lock();
        let registration = state.watches.register(target, mode);
        self.ensure_poller(&mut state);
        registration
    }

    /// Reload the file now and notify watches of any external change.
    pub async fn refresh(&self) -> Result<()> {
        self.blocking(|shared| shared.read(|_| ())).await
    }

    /// Stop background polling and end every watch stream.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.watches = WatchRegistry::new();
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        info!(path = %self.path().display(), "Property file store shut down");
    }

    fn ensure_poller(&self, state: &mut State) {
        let running = state.poller.as_ref().is_some_and(|p| !p.is_finished());
        if running {
            return;
        }
        debug!(interval = ?self.shared.poll_interval, "starting change poller");
        let weak = Arc::downgrade(&self.shared);
        state.poller = Some(
            self.shared
                .runtime
                .spawn(poll_loop(weak, self.shared.poll_interval)),
        );
    }

    fn register_callback(
        &self,
        target: &str,
        mode: MatchMode,
        callback: Box<dyn WatchCallback>,
    ) -> Result<WatchId> {
        validate_key(target).or_else(|e| match mode {
            MatchMode::Prefix => Ok(()),
            MatchMode::Exact => Err(e),
        })?;
        let (id, stream) = self.subscribe(target, mode);
        spawn_callback(&self.shared.runtime, stream, callback);
        Ok(id)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || f(&*shared)).await?
    }
}

impl Shared {
    /// Run `f` against an up-to-date snapshot.
    fn read<T>(&self, f: impl FnOnce(&Properties) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let mut locked = self.file.lock(LockMode::Shared)?;
        reconcile(&mut state, &mut locked, false)?;
        Ok(f(&state.snapshot))
    }

    /// Apply `actions` as one transaction and persist the result.
    fn commit(&self, actions: &[Action]) -> Result<()> {
        let mut state = self.state.lock();
        let mut locked = self.file.lock(LockMode::Exclusive)?;
        reconcile(&mut state, &mut locked, true)?;

        let before = state.snapshot.clone();
        let after = match apply_all(&before, actions) {
            Ok(after) => after,
            Err(err) => {
                warn!(error = %err, actions = actions.len(), "transaction rejected");
                return Err(err);
            }
        };

        let events = diff(&before, &after);
        if events.is_empty() {
            debug!(actions = actions.len(), "transaction changed nothing");
            return Ok(());
        }

        let fingerprint = locked.write(&after)?;
        drop(locked);
        debug!(
            actions = actions.len(),
            changes = events.len(),
            "transaction committed"
        );
        state.snapshot = after;
        state.fingerprint = Some(fingerprint);
        state.dispatch(&events);
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(poller) = self.state.get_mut().poller.take() {
            poller.abort();
        }
    }
}

/// Bring `state` in line with the file, notifying watches of the difference.
fn reconcile(state: &mut State, locked: &mut LockedFile<'_>, force: bool) -> Result<()> {
    let fingerprint = locked.fingerprint()?;
    if !force && state.fingerprint == Some(fingerprint) {
        return Ok(());
    }
    let current = locked.read()?;
    let events = diff(&state.snapshot, &current);
    if !events.is_empty() {
        debug!(changes = events.len(), "reloaded external changes");
    }
    state.snapshot = current;
    state.fingerprint = Some(fingerprint);
    state.dispatch(&events);
    Ok(())
}

async fn poll_loop(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || shared.read(|_| ())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "change poll failed"),
            Err(err) => warn!(error = %err, "change poll task failed"),
        }
    }
}

fn select_prefix(props: &Properties, prefix: &str) -> BTreeMap<String, String> {
    props
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[async_trait]
impl PropertyStore for PropertyFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |shared| shared.read(|props| props.get(&key).cloned()))
            .await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let prefix = prefix.to_string();
        self.blocking(move |shared| shared.read(|props| select_prefix(props, &prefix)))
            .await
    }

    async fn perform_actions(&self, actions: Vec<Action>) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        self.blocking(move |shared| shared.commit(&actions)).await
    }

    fn watch(&self, key: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        self.register_callback(key, MatchMode::Exact, callback)
    }

    fn watch_prefix(&self, prefix: &str, callback: Box<dyn WatchCallback>) -> Result<WatchId> {
        self.register_callback(prefix, MatchMode::Prefix, callback)
    }

    fn unwatch(&self, id: WatchId) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.watches.remove(id);
        state.stop_poller_if_idle();
        Ok(())
    }
}
