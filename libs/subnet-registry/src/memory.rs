//! In-process store with etcd v2 keys API semantics.
//!
//! Every handle returned by a [`MemoryConnector`] shares the same tree, so a
//! client reset keeps the data, like reconnecting to a real cluster would.
//! The store also lets callers inject watch failures, flip cluster health and
//! make client construction fail.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::EtcdConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::models::{EtcdError, Node, RawResponse, Response, error_code};
use crate::store::{Connector, KvStore};

/// Number of past events a watch can still resume from, as in etcd v2.
pub const DEFAULT_HISTORY_WINDOW: usize = 1000;

/// Failure to return from the next `raw_watch` call instead of waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFault {
    /// The request fails as if the connection dropped.
    Transport,
    /// The long-poll comes back with an empty body.
    EmptyResponse,
    /// A proxy in front of the store answers 502 with an HTML page.
    BadGateway,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    created_index: u64,
    modified_index: u64,
}

impl Entry {
    fn is_dir(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug)]
struct MemoryState {
    index: u64,
    entries: BTreeMap<String, Entry>,
    history: VecDeque<Response>,
    history_window: usize,
    /// Highest index dropped from `history`.
    cleared_through: u64,
    watch_faults: VecDeque<WatchFault>,
    watch_indexes: Vec<u64>,
    healthy: bool,
    connect_failures: u32,
    connections: u64,
    health_checks: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            index: 0,
            entries: BTreeMap::new(),
            history: VecDeque::new(),
            history_window: DEFAULT_HISTORY_WINDOW,
            cleared_through: 0,
            watch_faults: VecDeque::new(),
            watch_indexes: Vec::new(),
            healthy: true,
            connect_failures: 0,
            connections: 0,
            health_checks: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    changed: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Shared>,
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(key: &str) -> Option<&str> {
    match key.rfind('/') {
        Some(0) if key.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&key[..idx]),
    }
}

fn is_child_of(key: &str, dir: &str) -> bool {
    parent_of(key) == Some(dir)
}

fn is_under(key: &str, dir: &str) -> bool {
    dir == "/" || key.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

impl MemoryState {
    fn not_found(&self, key: &str) -> RegistryError {
        EtcdError::new(error_code::KEY_NOT_FOUND, "Key not found", key, self.index).into()
    }

    fn node(&self, key: &str, entry: &Entry, recursive: bool, depth: usize) -> Node {
        let mut node = Node {
            key: key.to_owned(),
            value: entry.value.clone(),
            dir: entry.is_dir(),
            modified_index: entry.modified_index,
            created_index: entry.created_index,
            ..Default::default()
        };
        if node.dir && (depth == 0 || recursive) {
            node.nodes = self
                .entries
                .iter()
                .filter(|(k, _)| is_child_of(k, key))
                .map(|(k, e)| self.node(k, e, recursive, depth + 1))
                .collect();
        }
        node
    }

    fn snapshot(&self, key: &str) -> Option<Node> {
        self.entries.get(key).map(|e| Node {
            key: key.to_owned(),
            value: e.value.clone(),
            dir: e.is_dir(),
            modified_index: e.modified_index,
            created_index: e.created_index,
            ..Default::default()
        })
    }

    /// Create missing parent directories of `key`, failing if one is a file.
    fn ensure_parents(&mut self, key: &str) -> RegistryResult<()> {
        let mut missing = Vec::new();
        let mut cursor = parent_of(key);
        while let Some(dir) = cursor {
            if dir == "/" {
                break;
            }
            match self.entries.get(dir) {
                Some(entry) if !entry.is_dir() => {
                    return Err(
                        EtcdError::new(error_code::NOT_DIR, "Not a directory", dir, self.index)
                            .into(),
                    );
                }
                Some(_) => break,
                None => missing.push(dir.to_owned()),
            }
            cursor = parent_of(dir);
        }
        for dir in missing {
            self.entries.insert(
                dir,
                Entry {
                    value: None,
                    created_index: self.index,
                    modified_index: self.index,
                },
            );
        }
        Ok(())
    }

    fn record(&mut self, action: &str, node: Node, prev_node: Option<Node>) -> Response {
        let resp = Response {
            action: action.to_owned(),
            node,
            prev_node,
            etcd_index: self.index,
        };
        self.history.push_back(resp.clone());
        while self.history.len() > self.history_window {
            if let Some(old) = self.history.pop_front() {
                self.cleared_through = old.node.modified_index;
            }
        }
        resp
    }

    fn write(&mut self, key: &str, value: Option<String>, action: &str) -> RegistryResult<Response> {
        self.ensure_parents(key)?;
        self.index += 1;
        let prev = self.snapshot(key);
        let created_index = match self.entries.get(key) {
            Some(entry) => entry.created_index,
            None => self.index,
        };
        let entry = Entry {
            value,
            created_index,
            modified_index: self.index,
        };
        self.entries.insert(key.to_owned(), entry.clone());
        let node = self.node(key, &entry, false, 1);
        Ok(self.record(action, node, prev))
    }

    fn remove(&mut self, key: &str, action: &str) -> Response {
        self.index += 1;
        let prev = self.snapshot(key);
        self.entries.retain(|k, _| k != key && !is_under(k, key));
        let node = Node {
            key: key.to_owned(),
            modified_index: self.index,
            created_index: prev.as_ref().map(|p| p.created_index).unwrap_or_default(),
            dir: prev.as_ref().is_some_and(|p| p.dir),
            ..Default::default()
        };
        self.record(action, node, prev)
    }

    fn next_event(&self, key: &str, since: u64, recursive: bool) -> Option<&Response> {
        // history is ordered by index, skip straight to `since`
        let start = self
            .history
            .partition_point(|resp| resp.node.modified_index < since);
        self.history.range(start..).find(|resp| {
            resp.node.key == key || (recursive && is_under(&resp.node.key, key))
        })
    }

    /// Error body etcd sends when `since` is older than the retained history.
    fn history_cleared(&self, since: u64) -> RawResponse {
        let err = EtcdError::new(
            error_code::WATCHER_CLEARED,
            "The event in requested index is outdated and cleared",
            &format!("the requested history has been cleared [{}/{since}]", self.cleared_through + 1),
            self.index,
        );
        let body = serde_json::to_vec(&err).unwrap_or_default();
        RawResponse::new(400, body, self.index)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that keeps only the last `window` events for watches.
    pub fn with_history_window(window: usize) -> Self {
        let store = Self::default();
        store.inner.state.lock().history_window = window.max(1);
        store
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut MemoryState) -> RegistryResult<T>) -> RegistryResult<T> {
        let out = f(&mut self.inner.state.lock());
        if out.is_ok() {
            self.inner.changed.notify_waiters();
        }
        out
    }

    /// Queue a failure for the next watch request.
    pub fn inject_watch_fault(&self, fault: WatchFault) {
        self.inner.state.lock().watch_faults.push_back(fault);
    }

    /// Make the next `count` client constructions fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.state.lock().connect_failures = count;
    }

    /// Whether `sync_cluster` reports a healthy cluster.
    pub fn set_healthy(&self, healthy: bool) {
        self.inner.state.lock().healthy = healthy;
    }

    /// Number of clients built so far.
    pub fn connections(&self) -> u64 {
        self.inner.state.lock().connections
    }

    /// Number of `sync_cluster` probes answered.
    pub fn health_checks(&self) -> u64 {
        self.inner.state.lock().health_checks
    }

    /// `wait_index` of every watch request seen, in order.
    pub fn watch_indexes(&self) -> Vec<u64> {
        self.inner.state.lock().watch_indexes.clone()
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.inner.state.lock().index
    }

    /// Drop a key as if its TTL ran out. Watchers see an `expired` action
    /// with the old value as the previous node.
    pub fn expire(&self, key: &str) -> RegistryResult<Response> {
        let key = normalize(key);
        self.mutate(|state| {
            if !state.entries.contains_key(&key) {
                return Err(state.not_found(&key));
            }
            Ok(state.remove(&key, "expired"))
        })
    }

    /// Unconditional write, creating or replacing the key.
    pub fn set(&self, key: &str, value: &str) -> RegistryResult<Response> {
        let key = normalize(key);
        self.mutate(|state| state.write(&key, Some(value.to_owned()), "set"))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str, _sorted: bool, recursive: bool) -> RegistryResult<Response> {
        let key = normalize(key);
        let state = self.inner.state.lock();
        let root = Entry {
            value: None,
            created_index: 0,
            modified_index: 0,
        };
        let entry = match state.entries.get(&key) {
            Some(entry) => entry,
            None if key == "/" => &root,
            None => return Err(state.not_found(&key)),
        };
        Ok(Response {
            action: "get".into(),
            node: state.node(&key, entry, recursive, 0),
            prev_node: None,
            etcd_index: state.index,
        })
    }

    async fn set_dir(&self, key: &str, _ttl: u64) -> RegistryResult<Response> {
        let key = normalize(key);
        self.mutate(|state| {
            // an existing leaf is replaced, an existing directory is refused
            if state.entries.get(&key).is_some_and(Entry::is_dir) {
                return Err(
                    EtcdError::new(error_code::NOT_FILE, "Not a file", &key, state.index).into(),
                );
            }
            state.write(&key, None, "set")
        })
    }

    async fn create(&self, key: &str, value: &str, _ttl: u64) -> RegistryResult<Response> {
        let key = normalize(key);
        self.mutate(|state| {
            if state.entries.contains_key(&key) {
                return Err(EtcdError::new(
                    error_code::NODE_EXIST,
                    "Key already exists",
                    &key,
                    state.index,
                )
                .into());
            }
            state.write(&key, Some(value.to_owned()), "create")
        })
    }

    async fn update(&self, key: &str, value: &str, _ttl: u64) -> RegistryResult<Response> {
        let key = normalize(key);
        self.mutate(|state| match state.entries.get(&key) {
            None => Err(state.not_found(&key)),
            Some(entry) if entry.is_dir() => {
                Err(EtcdError::new(error_code::NOT_FILE, "Not a file", &key, state.index).into())
            }
            Some(_) => state.write(&key, Some(value.to_owned()), "update"),
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> RegistryResult<Response> {
        let key = normalize(key);
        self.mutate(|state| match state.entries.get(&key) {
            None => Err(state.not_found(&key)),
            Some(entry) if entry.is_dir() && !recursive => {
                Err(EtcdError::new(error_code::NOT_FILE, "Not a file", &key, state.index).into())
            }
            Some(_) => Ok(state.remove(&key, "delete")),
        })
    }

    async fn raw_watch(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
        stop: &CancellationToken,
    ) -> RegistryResult<RawResponse> {
        let key = normalize(key);
        let since = {
            let mut state = self.inner.state.lock();
            state.watch_indexes.push(wait_index);
            if stop.is_cancelled() {
                return Err(RegistryError::WatchStopped);
            }
            match state.watch_faults.pop_front() {
                Some(WatchFault::Transport) => {
                    return Err(RegistryError::Transport(format!(
                        "injected transport failure watching '{key}'"
                    )));
                }
                Some(WatchFault::EmptyResponse) => {
                    return Ok(RawResponse::new(200, bytes::Bytes::new(), state.index));
                }
                Some(WatchFault::BadGateway) => {
                    return Ok(RawResponse::new(
                        502,
                        "<html><body>502 Bad Gateway</body></html>",
                        0,
                    ));
                }
                None => {}
            }
            if wait_index == 0 {
                state.index + 1
            } else if wait_index <= state.cleared_through {
                return Ok(state.history_cleared(wait_index));
            } else {
                wait_index
            }
        };

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if let Some(resp) = state.next_event(&key, since, recursive) {
                    let body = serde_json::to_vec(resp)
                        .map_err(|e| RegistryError::Transport(e.to_string()))?;
                    debug!(%key, index = resp.node.modified_index, "memory watch fired");
                    return Ok(RawResponse::new(200, body, state.index));
                }
            }
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(RegistryError::WatchStopped),
                _ = &mut notified => {}
            }
        }
    }

    async fn sync_cluster(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.health_checks += 1;
        state.healthy
    }
}

/// Connector handing out handles to one shared [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl Connector for MemoryConnector {
    type Store = MemoryStore;

    fn connect(&self, _config: &EtcdConfig) -> RegistryResult<MemoryStore> {
        let mut state = self.store.inner.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RegistryError::ClientConstruction(
                "injected connect failure".into(),
            ));
        }
        state.connections += 1;
        Ok(self.store.clone())
    }
}
