//! Typed models and codecs for registry records, domain events and the etcd
//! v2 keys API payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{RegistryError, RegistryResult};

// ---------------------------------------------------------------------------
// Subnet record
// ---------------------------------------------------------------------------

/// Subnet allocated to a single host.
///
/// The field names follow the JSON layout written by the rest of the network
/// controller; the registry only moves these values in and out of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubnetRecord {
    /// Host the subnet is assigned to.
    #[serde(rename = "Minion", default)]
    pub host: String,
    /// Subnet in CIDR notation.
    #[serde(rename = "Sub")]
    pub sub: String,
}

impl SubnetRecord {
    pub fn new(host: impl Into<String>, sub: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            sub: sub.into(),
        }
    }
}

/// Encode a value to its JSON string form.
pub fn encode<T: Serialize>(key: &str, value: &T) -> RegistryResult<String> {
    serde_json::to_string(value).map_err(|e| RegistryError::decode(key, e))
}

/// Decode a JSON value stored under `key`.
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> RegistryResult<T> {
    serde_json::from_str(raw).map_err(|e| RegistryError::decode(key, e))
}

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

/// Kind of change carried by a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Deleted,
}

impl EventType {
    /// Map a store notification action onto an event type. Anything that is
    /// not a removal counts as an addition.
    pub fn from_action(action: &str) -> Self {
        match action {
            "delete" | "deleted" | "expired" => EventType::Deleted,
            _ => EventType::Added,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Added => write!(f, "added"),
            EventType::Deleted => write!(f, "deleted"),
        }
    }
}

/// A host joined or left the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub kind: EventType,
    pub host: String,
}

/// A host's subnet assignment appeared or was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetEvent {
    pub kind: EventType,
    pub host: String,
    pub subnet: SubnetRecord,
}

// ---------------------------------------------------------------------------
// etcd v2 keys API
// ---------------------------------------------------------------------------

/// Error codes returned by the etcd v2 API that the registry cares about.
pub mod error_code {
    pub const KEY_NOT_FOUND: u64 = 100;
    pub const TEST_FAILED: u64 = 101;
    pub const NOT_FILE: u64 = 102;
    pub const NOT_DIR: u64 = 104;
    pub const NODE_EXIST: u64 = 105;
    pub const WATCHER_CLEARED: u64 = 401;
}

/// Error body returned by the store for a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdError {
    pub error_code: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub index: u64,
}

impl EtcdError {
    pub fn new(error_code: u64, message: &str, cause: &str, index: u64) -> Self {
        Self {
            error_code,
            message: message.to_owned(),
            cause: cause.to_owned(),
            index,
        }
    }

    pub fn is_key_not_found(&self) -> bool {
        self.error_code == error_code::KEY_NOT_FOUND
    }

    pub fn is_node_exist(&self) -> bool {
        self.error_code == error_code::NODE_EXIST
    }

    pub fn is_not_file(&self) -> bool {
        self.error_code == error_code::NOT_FILE
    }
}

impl std::fmt::Display for EtcdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "etcd error {}: {} ({}) [{}]",
            self.error_code, self.message, self.cause, self.index
        )
    }
}

/// A key or directory in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub modified_index: u64,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

impl Node {
    /// Value of a leaf key, empty for directories.
    pub fn value(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }
}

/// Decoded answer to a keys API request, also the shape of a watch
/// notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub action: String,
    #[serde(default)]
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,
    /// Store index at the time of the answer (`X-Etcd-Index` header).
    #[serde(skip)]
    pub etcd_index: u64,
}

/// Undecoded answer as it came off the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status_code: u16,
    pub body: Bytes,
    pub etcd_index: u64,
}

impl RawResponse {
    pub fn new(status_code: u16, body: impl Into<Bytes>, etcd_index: u64) -> Self {
        Self {
            status_code,
            body: body.into(),
            etcd_index,
        }
    }

    /// A long-poll that ran out of time comes back with no body at all.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Decode the body into a `Response`, or into the store error it carries.
    pub fn unmarshal(&self) -> RegistryResult<Response> {
        match self.status_code {
            200 | 201 => {
                let mut resp: Response = serde_json::from_slice(&self.body).map_err(|e| {
                    RegistryError::decode("<watch response>", e)
                })?;
                resp.etcd_index = self.etcd_index;
                Ok(resp)
            }
            status => {
                let err: EtcdError = serde_json::from_slice(&self.body).map_err(|e| {
                    RegistryError::Transport(format!(
                        "unexpected status {status} with undecodable body: {e}"
                    ))
                })?;
                Err(RegistryError::Etcd(err))
            }
        }
    }
}

/// Final segment of a store key, `10.0.0.7` for `/registry/subnets/10.0.0.7`.
pub fn key_leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Join a directory and a child name into a store key.
pub fn join_key(dir: &str, leaf: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), leaf.trim_start_matches('/'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
