//! Registry metrics.
//!
//! Registered lazily in the default prometheus registry on first access.
//! Registration failure means two counters share a name, which is a
//! programming error, so it panics.

use lazy_static::lazy_static;
use prometheus::{IntCounter, register_int_counter};

lazy_static! {
    /// Host events pushed onto a consumer queue
    pub static ref HOST_EVENTS: IntCounter = register_int_counter!(
        "registry_host_events",
        "count of host events delivered to the consumer"
    ).unwrap();

    /// Subnet events pushed onto a consumer queue
    pub static ref SUBNET_EVENTS: IntCounter = register_int_counter!(
        "registry_subnet_events",
        "count of subnet events delivered to the consumer"
    ).unwrap();

    /// Notifications that could not be translated into an event
    pub static ref DROPPED_NOTIFICATIONS: IntCounter = register_int_counter!(
        "registry_dropped_notifications",
        "count of watch notifications dropped because they failed to decode"
    ).unwrap();

    /// Watch attempts retried after a transport failure
    pub static ref WATCH_TRANSPORT_RETRIES: IntCounter = register_int_counter!(
        "registry_watch_transport_retries",
        "count of watch requests retried after a transport error"
    ).unwrap();

    /// Watch attempts retried after an expired long-poll
    pub static ref WATCH_EMPTY_RETRIES: IntCounter = register_int_counter!(
        "registry_watch_empty_retries",
        "count of watch requests retried after an empty long-poll response"
    ).unwrap();

    /// Store client rebuilds
    pub static ref CLIENT_RESETS: IntCounter = register_int_counter!(
        "registry_client_resets",
        "count of store client reconstructions"
    ).unwrap();
}
