//! # subnet-registry
//!
//! Host and subnet registry for the overlay network controller, stored in
//! an etcd v2 key space.
//!
//! This library provides:
//! - **Key-space management** for the host directory, the subnet directory
//!   and the network-wide configuration (container network, subnet length).
//! - **Subnet records** keyed by host, with create-or-overwrite semantics.
//! - **Watch loops** that long-poll the host and subnet directories and turn
//!   every change into a typed [`HostEvent`] or [`SubnetEvent`] on a bounded
//!   queue, surviving transport failures and expired long-polls.
//! - **Store backends**: an HTTP(S) etcd client with optional mutual TLS and
//!   an in-memory store for tests and offline use.
//!
//! ## Layout
//!
//! - [`store`] defines the [`KvStore`] seam and the [`Connector`] that
//!   builds store clients, so the registry can rebuild its client at any time.
//! - [`registry`] holds the shared client and all key-space operations.
//! - [`watch`] holds the watch state machine and notification translation.

pub mod config;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod store;
pub mod watch;

pub use config::EtcdConfig;
pub use error::{RegistryError, RegistryResult};
pub use etcd::{EtcdClient, EtcdConnector};
pub use memory::{MemoryConnector, MemoryStore, WatchFault};
pub use models::{EventType, HostEvent, SubnetEvent, SubnetRecord};
pub use registry::{SubnetListing, SubnetRegistry};
pub use store::{Connector, KvStore};
pub use watch::{RetryReason, WatchCursor, WatchStep, host_event, subnet_event};
