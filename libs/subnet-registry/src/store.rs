//! Abstract store interface consumed by the registry.
//!
//! `KvStore` is the subset of the etcd v2 keys API the registry uses. The
//! registry only ever holds a store through a [`Connector`], so that the
//! client can be rebuilt from configuration after a transport failure.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EtcdConfig;
use crate::error::RegistryResult;
use crate::models::{RawResponse, Response};

/// Hierarchical key-value store with directory semantics and indexed watches.
#[async_trait]
pub trait KvStore: Send + Sync + Debug + 'static {
    /// Read a key or directory.
    async fn get(&self, key: &str, sorted: bool, recursive: bool) -> RegistryResult<Response>;

    /// Create a directory. A `ttl` of 0 means the directory never expires.
    async fn set_dir(&self, key: &str, ttl: u64) -> RegistryResult<Response>;

    /// Create a key that must not already exist.
    async fn create(&self, key: &str, value: &str, ttl: u64) -> RegistryResult<Response>;

    /// Replace the value of a key that must already exist.
    async fn update(&self, key: &str, value: &str, ttl: u64) -> RegistryResult<Response>;

    /// Remove a key.
    async fn delete(&self, key: &str, recursive: bool) -> RegistryResult<Response>;

    /// Block until a change at or after `wait_index` happens under `key`, the
    /// long-poll expires (empty body), or `stop` fires
    /// ([`RegistryError::WatchStopped`]). A `wait_index` of 0 waits for the
    /// next change.
    ///
    /// [`RegistryError::WatchStopped`]: crate::error::RegistryError::WatchStopped
    async fn raw_watch(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
        stop: &CancellationToken,
    ) -> RegistryResult<RawResponse>;

    /// Probe cluster membership; true if any member answered.
    async fn sync_cluster(&self) -> bool;
}

/// Builds store clients from configuration.
pub trait Connector: Send + Sync + Debug + 'static {
    type Store: KvStore;

    /// Build a new client. Called once at registry construction and again on
    /// every client reset.
    fn connect(&self, config: &EtcdConfig) -> RegistryResult<Self::Store>;
}
