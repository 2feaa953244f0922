//! Watch loops translating store notifications into host and subnet events.
//!
//! Each loop long-polls its directory from a local [`WatchCursor`], absorbs
//! transport failures and expired long-polls by rebuilding the store client,
//! and pushes typed events onto a bounded queue owned by the consumer. The
//! send waits for queue capacity, so a consumer that stops draining stalls
//! the loop instead of losing events.
//!
//! ```text
//!            transport error / empty body (cursor unchanged)
//!               +--------+
//!               v        |
//!  start --> WATCHING ---+---- notification --> emit, cursor = index + 1 --+
//!               |  ^                                                        |
//!               |  +--------------------------------------------------------+
//!               +---- stop signal --> STOPPED (WatchStopped returned)
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::metrics;
use crate::models::{
    self, EventType, HostEvent, Response, SubnetEvent, SubnetRecord, error_code, key_leaf,
};
use crate::registry::SubnetRegistry;
use crate::store::{Connector, KvStore};

/// Pause before rebuilding the client after a failed watch request.
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Store revision a watch resumes from. 0 means "from now".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatchCursor(u64);

impl WatchCursor {
    pub fn index(&self) -> u64 {
        self.0
    }

    /// Move past `index`. The cursor never moves backwards.
    pub fn advance_past(&mut self, index: u64) {
        self.0 = self.0.max(index.saturating_add(1));
    }
}

/// Why a watch attempt produced no notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The request failed in transport, or the store answered with an error
    /// other than a cleared history; the client was rebuilt after a pause.
    Transport,
    /// The long-poll expired with an empty body; the client was rebuilt
    /// because the underlying HTTP connection is not reusable after that.
    EmptyResponse,
    /// The store no longer holds history at the cursor; resume from `index`.
    HistoryCleared { index: u64 },
}

/// Outcome of a single watch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchStep {
    Notification(Response),
    Retry(RetryReason),
}

/// Translate a host-directory notification.
pub fn host_event(resp: &Response) -> RegistryResult<HostEvent> {
    if resp.node.key.is_empty() {
        return Err(RegistryError::decode(
            "",
            format!("host notification without a key (action {})", resp.action),
        ));
    }
    Ok(HostEvent {
        kind: EventType::from_action(&resp.action),
        host: key_leaf(&resp.node.key).to_owned(),
    })
}

/// Translate a subnet-directory notification. Removals carry the record as it
/// was just before the key went away.
pub fn subnet_event(resp: &Response) -> RegistryResult<SubnetEvent> {
    let key = &resp.node.key;
    let kind = EventType::from_action(&resp.action);
    let value = match kind {
        EventType::Deleted => resp
            .prev_node
            .as_ref()
            .map(|prev| prev.value())
            .ok_or_else(|| RegistryError::decode(key, "removal without a previous value"))?,
        EventType::Added => resp.node.value(),
    };
    let subnet: SubnetRecord = models::decode(key, value)?;
    Ok(SubnetEvent {
        kind,
        host: key_leaf(key).to_owned(),
        subnet,
    })
}

/// Long-poll state for one directory.
struct Watcher<'a, C: Connector> {
    registry: &'a SubnetRegistry<C>,
    key: String,
    cursor: WatchCursor,
}

impl<'a, C: Connector> Watcher<'a, C> {
    fn new(registry: &'a SubnetRegistry<C>, key: String) -> Self {
        Self {
            registry,
            key,
            cursor: WatchCursor::default(),
        }
    }

    /// Wait for the next notification, retrying through every transient
    /// condition. Only a stop or a fatal client failure ends this early.
    async fn next(&mut self, stop: &CancellationToken) -> RegistryResult<Response> {
        loop {
            match self.registry.watch_once(&self.key, self.cursor, stop).await {
                Ok(WatchStep::Notification(resp)) => {
                    self.cursor.advance_past(resp.node.modified_index);
                    return Ok(resp);
                }
                Ok(WatchStep::Retry(RetryReason::HistoryCleared { index })) => {
                    warn!(key = %self.key, from = self.cursor.index(), to = index.saturating_add(1), "watch history cleared, skipping ahead");
                    self.cursor.advance_past(index);
                }
                Ok(WatchStep::Retry(reason)) => {
                    debug!(key = %self.key, ?reason, cursor = self.cursor.index(), "retrying watch");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn deliver<T>(
    events: &mpsc::Sender<T>,
    event: T,
    stop: &CancellationToken,
    which: &'static str,
) -> RegistryResult<()> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(RegistryError::WatchStopped),
        sent = events.send(event) => sent.map_err(|_| RegistryError::EventQueueClosed(which)),
    }
}

impl<C: Connector> SubnetRegistry<C> {
    /// Issue one watch request on `key` from `cursor`.
    ///
    /// Transport failures, error answers and empty long-polls rebuild the
    /// client and come back as [`WatchStep::Retry`]. A fired `stop` comes back
    /// as [`RegistryError::WatchStopped`], and a failed rebuild as
    /// [`RegistryError::ClientConstruction`]; nothing else is returned as an
    /// error.
    pub async fn watch_once(
        &self,
        key: &str,
        cursor: WatchCursor,
        stop: &CancellationToken,
    ) -> RegistryResult<WatchStep> {
        let raw = match self.client().raw_watch(key, cursor.index(), true, stop).await {
            Ok(raw) => raw,
            Err(RegistryError::WatchStopped) => return Err(RegistryError::WatchStopped),
            Err(err) => {
                warn!(key, error = %err, "temporary error while watching");
                return self.back_off(stop).await;
            }
        };

        if raw.is_empty() {
            debug!(key, cursor = cursor.index(), "watch long-poll expired, rebuilding client");
            metrics::WATCH_EMPTY_RETRIES.inc();
            self.reset_client()?;
            return Ok(WatchStep::Retry(RetryReason::EmptyResponse));
        }

        match raw.unmarshal() {
            Ok(resp) => Ok(WatchStep::Notification(resp)),
            Err(RegistryError::Etcd(err)) if err.error_code == error_code::WATCHER_CLEARED => {
                Ok(WatchStep::Retry(RetryReason::HistoryCleared { index: err.index }))
            }
            Err(err) => {
                error!(key, status = raw.status_code, error = %err, "bad watch response");
                self.back_off(stop).await
            }
        }
    }

    /// Wait out the transport retry delay, then rebuild the client. A stop
    /// during the wait ends it early.
    async fn back_off(&self, stop: &CancellationToken) -> RegistryResult<WatchStep> {
        metrics::WATCH_TRANSPORT_RETRIES.inc();
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(RegistryError::WatchStopped),
            _ = tokio::time::sleep(TRANSPORT_RETRY_DELAY) => {}
        }
        self.reset_client()?;
        Ok(WatchStep::Retry(RetryReason::Transport))
    }

    /// Watch the host directory until `stop` fires, sending a [`HostEvent`]
    /// for every change.
    ///
    /// Returns [`RegistryError::WatchStopped`] on a stop. Also returns early
    /// on a fatal client reconstruction failure, or when `events` has no
    /// receiver left.
    pub async fn watch_hosts(
        &self,
        events: mpsc::Sender<HostEvent>,
        stop: CancellationToken,
    ) -> RegistryResult<()> {
        let mut watcher = Watcher::new(self, self.config().host_path.clone());
        info!(key = %watcher.key, "watching for host changes");
        loop {
            let resp = watcher.next(&stop).await.inspect_err(|err| {
                info!(error = %err, "host watch finished");
            })?;
            debug!(?resp, cursor = watcher.cursor.index(), "host notification");
            let event = match host_event(&resp) {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, action = %resp.action, "dropping host notification");
                    metrics::DROPPED_NOTIFICATIONS.inc();
                    continue;
                }
            };
            info!(kind = %event.kind, host = %event.host, "issuing host event");
            deliver(&events, event, &stop, "host").await?;
            metrics::HOST_EVENTS.inc();
        }
    }

    /// Watch the subnet directory until `stop` fires, sending a
    /// [`SubnetEvent`] for every change that decodes.
    ///
    /// Same termination rules as [`watch_hosts`](Self::watch_hosts).
    pub async fn watch_subnets(
        &self,
        events: mpsc::Sender<SubnetEvent>,
        stop: CancellationToken,
    ) -> RegistryResult<()> {
        let mut watcher = Watcher::new(self, self.config().subnet_path.clone());
        info!(key = %watcher.key, "watching for subnet changes");
        loop {
            let resp = watcher.next(&stop).await.inspect_err(|err| {
                info!(error = %err, "subnet watch finished");
            })?;
            let event = match subnet_event(&resp) {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, action = %resp.action, "failed to decode subnet notification");
                    metrics::DROPPED_NOTIFICATIONS.inc();
                    continue;
                }
            };
            info!(kind = %event.kind, host = %event.host, subnet = %event.subnet.sub, "new subnet event");
            deliver(&events, event, &stop, "subnet").await?;
            metrics::SUBNET_EVENTS.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::task::JoinHandle;
    use tracing::Instrument;
    use tracing_test::traced_test;

    use super::*;
    use crate::config::EtcdConfig;
    use crate::memory::{MemoryConnector, MemoryStore, WatchFault};
    use crate::models::Node;

    type Registry = Arc<SubnetRegistry<MemoryConnector>>;

    fn registry() -> (Registry, MemoryStore) {
        let connector = MemoryConnector::default();
        let store = connector.store().clone();
        let registry = SubnetRegistry::with_connector(connector, EtcdConfig::default()).unwrap();
        (Arc::new(registry), store)
    }

    /// Let the loop run until the store has seen `count` watch requests.
    async fn wait_for_watches(store: &MemoryStore, count: usize) {
        while store.watch_indexes().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn spawn_hosts(
        registry: &Registry,
        capacity: usize,
    ) -> (
        mpsc::Receiver<HostEvent>,
        CancellationToken,
        JoinHandle<RegistryResult<()>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let stop = CancellationToken::new();
        let handle = {
            let registry = Arc::clone(registry);
            let stop = stop.clone();
            tokio::spawn(async move { registry.watch_hosts(tx, stop).await }.in_current_span())
        };
        (rx, stop, handle)
    }

    fn spawn_subnets(
        registry: &Registry,
    ) -> (
        mpsc::Receiver<SubnetEvent>,
        CancellationToken,
        JoinHandle<RegistryResult<()>>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let handle = {
            let registry = Arc::clone(registry);
            let stop = stop.clone();
            tokio::spawn(async move { registry.watch_subnets(tx, stop).await }.in_current_span())
        };
        (rx, stop, handle)
    }

    fn notification(action: &str, key: &str, value: Option<&str>, prev: Option<&str>) -> Response {
        Response {
            action: action.into(),
            node: Node {
                key: key.into(),
                value: value.map(Into::into),
                modified_index: 12,
                ..Default::default()
            },
            prev_node: prev.map(|v| Node {
                key: key.into(),
                value: Some(v.into()),
                modified_index: 9,
                ..Default::default()
            }),
            etcd_index: 12,
        }
    }

    #[test]
    fn test_cursor_only_advances() {
        let mut cursor = WatchCursor::default();
        assert_eq!(cursor.index(), 0);
        cursor.advance_past(10);
        assert_eq!(cursor.index(), 11);
        cursor.advance_past(4);
        assert_eq!(cursor.index(), 11);
        cursor.advance_past(u64::MAX);
        assert_eq!(cursor.index(), u64::MAX);
    }

    #[test]
    fn test_host_event_translation() {
        let added = host_event(&notification("create", "/registry/minions/10.0.0.5", Some(""), None)).unwrap();
        assert_eq!(
            added,
            HostEvent {
                kind: EventType::Added,
                host: "10.0.0.5".into()
            }
        );
        let deleted = host_event(&notification("delete", "/registry/minions/10.0.0.5", None, Some(""))).unwrap();
        assert_eq!(deleted.kind, EventType::Deleted);
    }

    #[test]
    fn test_host_event_without_key_is_error() {
        let err = host_event(&notification("set", "", Some("x"), None)).unwrap_err();
        assert!(matches!(err, RegistryError::Decode { .. }));
    }

    #[test]
    fn test_subnet_event_expired_uses_previous_value() {
        let resp = notification(
            "expired",
            "/registry/subnets/10.0.0.7",
            None,
            Some(r#"{"Sub":"10.1.7.0/24"}"#),
        );
        let event = subnet_event(&resp).unwrap();
        assert_eq!(event.kind, EventType::Deleted);
        assert_eq!(event.host, "10.0.0.7");
        assert_eq!(event.subnet.sub, "10.1.7.0/24");
    }

    #[test]
    fn test_subnet_event_added_uses_current_value() {
        let resp = notification(
            "update",
            "/registry/subnets/10.0.0.7",
            Some(r#"{"Minion":"10.0.0.7","Sub":"10.1.8.0/24"}"#),
            Some(r#"{"Minion":"10.0.0.7","Sub":"10.1.7.0/24"}"#),
        );
        let event = subnet_event(&resp).unwrap();
        assert_eq!(event.kind, EventType::Added);
        assert_eq!(event.subnet, SubnetRecord::new("10.0.0.7", "10.1.8.0/24"));
    }

    #[test]
    fn test_subnet_event_malformed() {
        let resp = notification("set", "/registry/subnets/10.0.0.7", Some("nope"), None);
        assert!(matches!(subnet_event(&resp), Err(RegistryError::Decode { .. })));
        let resp = notification("delete", "/registry/subnets/10.0.0.7", None, None);
        assert!(matches!(subnet_event(&resp), Err(RegistryError::Decode { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_once_classifies_steps() {
        let (registry, store) = registry();
        let stop = CancellationToken::new();
        let key = "/registry/minions";
        registry.create_host("10.0.0.5", "").await.unwrap();

        store.inject_watch_fault(WatchFault::Transport);
        store.inject_watch_fault(WatchFault::EmptyResponse);
        let cursor = WatchCursor(1);
        assert_eq!(
            registry.watch_once(key, cursor, &stop).await.unwrap(),
            WatchStep::Retry(RetryReason::Transport)
        );
        assert_eq!(
            registry.watch_once(key, cursor, &stop).await.unwrap(),
            WatchStep::Retry(RetryReason::EmptyResponse)
        );
        assert_eq!(registry.client_generation(), 3);

        match registry.watch_once(key, cursor, &stop).await.unwrap() {
            WatchStep::Notification(resp) => assert_eq!(resp.node.key, "/registry/minions/10.0.0.5"),
            other => panic!("expected notification, got: {other:?}"),
        }

        stop.cancel();
        assert!(matches!(
            registry.watch_once(key, cursor, &stop).await,
            Err(RegistryError::WatchStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_answer_backs_off_and_rebuilds() {
        let (registry, store) = registry();
        let stop = CancellationToken::new();
        store.inject_watch_fault(WatchFault::BadGateway);

        let started = tokio::time::Instant::now();
        assert_eq!(
            registry.watch_once("/registry/minions", WatchCursor(0), &stop).await.unwrap(),
            WatchStep::Retry(RetryReason::Transport)
        );
        assert!(started.elapsed() >= TRANSPORT_RETRY_DELAY);
        assert_eq!(registry.client_generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_answers_do_not_spin() {
        let (registry, store) = registry();
        registry.init_hosts_namespace().await.unwrap();
        for _ in 0..3 {
            store.inject_watch_fault(WatchFault::BadGateway);
        }
        let started = tokio::time::Instant::now();
        let (mut rx, stop, handle) = spawn_hosts(&registry, 8);

        wait_for_watches(&store, 4).await;
        assert!(started.elapsed() >= TRANSPORT_RETRY_DELAY * 3);
        assert_eq!(store.watch_indexes(), vec![0, 0, 0, 0]);
        assert_eq!(registry.client_generation(), 4);

        registry.create_host("10.0.0.5", "").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().host, "10.0.0.5");

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_back_off() {
        let (registry, store) = registry();
        store.inject_watch_fault(WatchFault::Transport);
        let (_rx, stop, handle) = spawn_hosts(&registry, 1);
        wait_for_watches(&store, 1).await;

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
        // the client is not rebuilt once stopped
        assert_eq!(registry.client_generation(), 1);
        assert_eq!(store.watch_indexes().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cleared_history_skips_ahead() {
        let store = MemoryStore::with_history_window(2);
        let registry = Arc::new(
            SubnetRegistry::with_connector(MemoryConnector::new(store.clone()), EtcdConfig::default())
                .unwrap(),
        );
        registry.init_hosts_namespace().await.unwrap();
        let (mut rx, stop, handle) = spawn_hosts(&registry, 1);
        wait_for_watches(&store, 1).await;

        // the first event fills the queue, the loop then stalls on the second
        registry.create_host("10.0.0.1", "").await.unwrap();
        registry.create_host("10.0.0.2", "").await.unwrap();
        wait_for_watches(&store, 2).await;
        // push the loop's next cursor out of the retained history
        for host in ["10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"] {
            registry.create_host(host, "").await.unwrap();
        }
        let current = store.index();

        assert_eq!(rx.recv().await.unwrap().host, "10.0.0.1");
        assert_eq!(rx.recv().await.unwrap().host, "10.0.0.2");
        wait_for_watches(&store, 4).await;
        assert_eq!(store.watch_indexes(), vec![0, 3, 4, current + 1]);
        assert!(logs_contain("watch history cleared"));

        registry.create_host("10.0.0.7", "").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().host, "10.0.0.7");

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_one_event() {
        let (registry, store) = registry();
        registry.init_hosts_namespace().await.unwrap();
        store.inject_watch_fault(WatchFault::Transport);
        store.inject_watch_fault(WatchFault::EmptyResponse);
        store.inject_watch_fault(WatchFault::Transport);
        let (mut rx, stop, handle) = spawn_hosts(&registry, 8);

        // three failed attempts, then one request left waiting
        wait_for_watches(&store, 4).await;
        assert_eq!(store.watch_indexes(), vec![0, 0, 0, 0]);
        registry.create_host("10.0.0.5", "").await.unwrap();
        let index = store.index();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.host, "10.0.0.5");
        assert_eq!(event.kind, EventType::Added);

        wait_for_watches(&store, 5).await;
        assert_eq!(store.watch_indexes()[4], index + 1);
        assert_eq!(registry.client_generation(), 4);

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_while_blocked() {
        let (registry, store) = registry();
        let (mut rx, stop, handle) = spawn_hosts(&registry, 8);
        wait_for_watches(&store, 1).await;

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
        registry.create_host("10.0.0.9", "").await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_host_events_in_order() {
        let (registry, store) = registry();
        registry.init_hosts_namespace().await.unwrap();
        let (mut rx, stop, handle) = spawn_hosts(&registry, 1);
        wait_for_watches(&store, 1).await;

        for host in ["10.0.0.5", "10.0.0.6", "10.0.0.7"] {
            registry.create_host(host, "").await.unwrap();
        }
        store.expire("/registry/minions/10.0.0.6").unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            seen.push((event.kind, event.host));
        }
        assert_eq!(
            seen,
            vec![
                (EventType::Added, "10.0.0.5".to_owned()),
                (EventType::Added, "10.0.0.6".to_owned()),
                (EventType::Added, "10.0.0.7".to_owned()),
                (EventType::Deleted, "10.0.0.6".to_owned()),
            ]
        );

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
    }

    #[tokio::test]
    async fn test_stop_while_queue_full() {
        let (registry, store) = registry();
        let (_rx, stop, handle) = spawn_hosts(&registry, 1);
        wait_for_watches(&store, 1).await;

        registry.create_host("10.0.0.5", "").await.unwrap();
        registry.create_host("10.0.0.6", "").await.unwrap();
        // first event fills the queue, the second one stalls the loop
        wait_for_watches(&store, 2).await;

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
    }

    #[tokio::test]
    async fn test_closed_queue_ends_loop() {
        let (registry, store) = registry();
        let (rx, _stop, handle) = spawn_hosts(&registry, 1);
        wait_for_watches(&store, 1).await;
        drop(rx);

        registry.create_host("10.0.0.5", "").await.unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(RegistryError::EventQueueClosed("host"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_reset_ends_loop() {
        let (registry, store) = registry();
        store.inject_watch_fault(WatchFault::Transport);
        store.fail_next_connects(1);
        let (_rx, _stop, handle) = spawn_hosts(&registry, 1);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }

    #[tokio::test]
    async fn test_subnet_expired_event() {
        let (registry, store) = registry();
        registry.init_subnets_namespace().await.unwrap();
        store
            .set("/registry/subnets/10.0.0.7", r#"{"Sub":"10.1.7.0/24"}"#)
            .unwrap();
        let (mut rx, stop, handle) = spawn_subnets(&registry);
        wait_for_watches(&store, 1).await;

        store.expire("/registry/subnets/10.0.0.7").unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventType::Deleted);
        assert_eq!(event.host, "10.0.0.7");
        assert_eq!(event.subnet.sub, "10.1.7.0/24");

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_subnet_watch_drops_malformed() {
        let (registry, store) = registry();
        registry.init_subnets_namespace().await.unwrap();
        let (mut rx, stop, handle) = spawn_subnets(&registry);
        wait_for_watches(&store, 1).await;

        store.set("/registry/subnets/10.0.0.8", "{garbage").unwrap();
        let record = SubnetRecord::new("10.0.0.9", "10.1.9.0/24");
        registry
            .create_or_update_subnet("10.0.0.9", &record)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventType::Added);
        assert_eq!(event.subnet, record);
        assert!(logs_contain("failed to decode subnet notification"));

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), Err(RegistryError::WatchStopped)));
        assert!(rx.try_recv().is_err());
    }
}
